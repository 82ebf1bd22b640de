//! Declarative metric specifications
//!
//! Operators describe the monitor attributes they care about as a map of
//! `attribute -> "Metric Name;unit"`, one map for counters and one for gauges,
//! per monitoring scope. This module turns those maps into lookup tables keyed
//! by the lower-cased attribute name.
//!
//! A metric name may carry a single [`PLACEHOLDER`] token. Scopes that
//! discover sub-resources at runtime, per-file database statistics for
//! instance, substitute the discovered name for the token.

use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Token in a metric name replaced by a discovered sub-resource name.
pub const PLACEHOLDER: &str = "%s";

const DELIMITER: char = ';';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced while parsing metric specifications
pub enum Error {
    /// The specification value has no `;` between metric name and unit.
    #[error("Malformed metric specification for attribute {attribute}: {value:?}")]
    MalformedSpec {
        /// Raw attribute the specification was declared for
        attribute: String,
        /// The offending specification value
        value: String,
    },
    /// The attribute appears in both the counter and gauge maps of one scope.
    #[error("Attribute {0} is declared as both a counter and a gauge")]
    DuplicateAttribute(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a matched attribute is reported
pub enum Kind {
    /// Monotonic counter, reported as a rate and a cumulative count.
    Counter,
    /// Point-in-time value, reported as-is.
    Gauge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single `(attribute, metric, unit)` specification
pub struct MetricSpec {
    /// Lower-cased raw attribute name
    pub attribute: String,
    /// Reported metric name, possibly containing [`PLACEHOLDER`]
    pub metric: String,
    /// Unit of the raw value
    pub unit: String,
}

impl MetricSpec {
    /// Parse `value`, of the form `"<metric>;<unit>"`, declared for
    /// `attribute`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSpec`] if `value` has no `;` delimiter.
    pub fn parse(attribute: &str, value: &str) -> Result<Self, Error> {
        let Some((metric, unit)) = value.split_once(DELIMITER) else {
            return Err(Error::MalformedSpec {
                attribute: attribute.to_string(),
                value: value.to_string(),
            });
        };
        Ok(Self {
            attribute: attribute.to_lowercase(),
            metric: metric.to_string(),
            unit: unit.to_string(),
        })
    }

    /// Whether the metric name carries a [`PLACEHOLDER`].
    #[must_use]
    pub fn has_placeholder(&self) -> bool {
        self.metric.contains(PLACEHOLDER)
    }

    /// The metric name with `substitution` in place of the placeholder.
    ///
    /// Without a substitution, or without a placeholder, the metric name is
    /// returned unchanged.
    #[must_use]
    pub fn resolve(&self, substitution: Option<&str>) -> String {
        match substitution {
            Some(sub) if self.has_placeholder() => self.metric.replacen(PLACEHOLDER, sub, 1),
            _ => self.metric.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Specifications keyed by lower-cased raw attribute name
pub struct SpecTable {
    inner: FxHashMap<String, MetricSpec>,
}

impl SpecTable {
    /// Parse a raw `attribute -> "metric;unit"` map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSpec`] for the first value lacking a
    /// delimiter.
    pub fn parse(raw: &FxHashMap<String, String>) -> Result<Self, Error> {
        let mut inner = FxHashMap::default();
        for (attribute, value) in raw {
            let spec = MetricSpec::parse(attribute, value)?;
            inner.insert(spec.attribute.clone(), spec);
        }
        Ok(Self { inner })
    }

    /// Look up `attribute`, ignoring case.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&MetricSpec> {
        self.inner
            .get(attribute)
            .or_else(|| self.inner.get(&attribute.to_lowercase()))
    }

    /// Whether `attribute` is declared, ignoring case.
    #[must_use]
    pub fn contains(&self, attribute: &str) -> bool {
        self.get(attribute).is_some()
    }

    /// Iterate the declared specifications.
    pub fn iter(&self) -> impl Iterator<Item = &MetricSpec> {
        self.inner.values()
    }

    /// Number of declared specifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no specification is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Raw counter and gauge specification maps for one scope
pub struct Config {
    /// `attribute -> "metric;unit"` for monotonic counters
    #[serde(default)]
    pub counters: FxHashMap<String, String>,
    /// `attribute -> "metric;unit"` for gauges
    #[serde(default)]
    pub gauges: FxHashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The counter and gauge tables of one monitoring scope
pub struct ScopeSpecs {
    counters: SpecTable,
    gauges: SpecTable,
}

impl ScopeSpecs {
    /// Parse the counter and gauge maps of one scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSpec`] if any value lacks a delimiter and
    /// [`Error::DuplicateAttribute`] if an attribute is declared in both maps.
    pub fn parse(
        counters: &FxHashMap<String, String>,
        gauges: &FxHashMap<String, String>,
    ) -> Result<Self, Error> {
        let counters = SpecTable::parse(counters)?;
        let gauges = SpecTable::parse(gauges)?;
        if let Some(dup) = counters.iter().find(|spec| gauges.contains(&spec.attribute)) {
            return Err(Error::DuplicateAttribute(dup.attribute.clone()));
        }
        Ok(Self { counters, gauges })
    }

    /// Parse from a scope [`Config`].
    ///
    /// # Errors
    ///
    /// See [`ScopeSpecs::parse`].
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::parse(&config.counters, &config.gauges)
    }

    /// Find the specification for `attribute` and how it is reported.
    #[must_use]
    pub fn lookup(&self, attribute: &str) -> Option<(Kind, &MetricSpec)> {
        self.counters
            .get(attribute)
            .map(|spec| (Kind::Counter, spec))
            .or_else(|| self.gauges.get(attribute).map(|spec| (Kind::Gauge, spec)))
    }

    /// Whether `attribute` is declared as either counter or gauge.
    #[must_use]
    pub fn contains(&self, attribute: &str) -> bool {
        self.lookup(attribute).is_some()
    }

    /// The counter table.
    #[must_use]
    pub fn counters(&self) -> &SpecTable {
        &self.counters
    }

    /// The gauge table.
    #[must_use]
    pub fn gauges(&self) -> &SpecTable {
        &self.gauges
    }

    /// Whether the scope declares nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }
}
