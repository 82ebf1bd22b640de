//! Destinations for reported metrics
//!
//! The engine pushes each `(name, unit, value)` triple to a [`Sink`] as soon
//! as it is produced. [`MetricsSink`] publishes through the `metrics` facade,
//! whatever recorder is installed. `Vec<Report>` collects reports in memory.

use metrics::gauge;
use tracing::trace;

/// Receives every report of a poll cycle.
pub trait Sink {
    /// Report `value`, measured in `unit`, under `name`.
    fn report(&mut self, name: &str, unit: &str, value: f64);
}

/// One reported value
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Full metric name, `<Scope>/<Metric>[/Rate|/Count]`
    pub name: String,
    /// Unit of `value`
    pub unit: String,
    /// The reported value
    pub value: f64,
}

impl Sink for Vec<Report> {
    fn report(&mut self, name: &str, unit: &str, value: f64) {
        self.push(Report {
            name: name.to_string(),
            unit: unit.to_string(),
            value,
        });
    }
}

/// Publishes reports as gauges through the `metrics` facade.
///
/// Every gauge carries an `agent` label, so several agents may share one
/// recorder, and a `unit` label.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    agent: String,
}

impl MetricsSink {
    /// Create a new [`MetricsSink`] labelling its gauges with `agent`
    #[must_use]
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }
}

impl Sink for MetricsSink {
    fn report(&mut self, name: &str, unit: &str, value: f64) {
        trace!("{name} = {value} {unit}");
        let labels = vec![
            ("agent".to_string(), self.agent.clone()),
            ("unit".to_string(), unit.to_string()),
        ];
        gauge!(name.to_string(), &labels).set(value);
    }
}
