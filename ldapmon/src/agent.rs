//! The host loop
//!
//! An [`Agent`] polls one directory server on a fixed period. Every cycle
//! opens a fresh connection, runs the [`Engine`] over it and releases it
//! again. A failed cycle is logged and the next one proceeds as usual; rate
//! history lives in the engine and is kept.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    directory::{self, Connector, Directory},
    engine::{self, Engine},
    sink::Sink,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by one [`Agent`] poll cycle
pub enum Error {
    /// The connection could not be opened or bound.
    #[error("Failed to connect: {0}")]
    Connect(#[source] directory::Error),
    /// The cycle failed after connecting.
    #[error(transparent)]
    Poll(#[from] engine::Error),
}

/// Polls a directory server until cancelled.
#[derive(Debug)]
pub struct Agent<C, S> {
    connector: C,
    engine: Engine,
    sink: S,
    sample_period: Duration,
}

impl<C, S> Agent<C, S>
where
    C: Connector,
    S: Sink,
{
    /// Create a new [`Agent`]
    ///
    /// Privileged processing follows the connector's bind: an anonymous
    /// connector never reads database or backend entries.
    #[must_use]
    pub fn new(connector: C, engine: Engine, sink: S, sample_period: Duration) -> Self {
        let engine = engine.privileged(!connector.is_anonymous());
        Self {
            connector,
            engine,
            sink,
            sample_period,
        }
    }

    /// Run one poll cycle. The connection is released whether or not the
    /// cycle succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if no connection could be opened and
    /// [`Error::Poll`] if the cycle was cut short.
    pub async fn poll_cycle(&mut self) -> Result<(), Error> {
        let mut directory = self.connector.connect().await.map_err(Error::Connect)?;
        let result = self.engine.poll(&mut directory, &mut self.sink).await;
        if let Err(err) = directory.close().await {
            warn!("Failed to release connection: {err}");
        }
        result.map_err(Error::from)
    }

    /// Run this [`Agent`] until `shutdown` is cancelled.
    ///
    /// The first cycle runs immediately. Cycles never overlap: a cycle
    /// outlasting the period delays the next one.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Polling directory server at {:?} interval",
            self.sample_period
        );
        let mut poll = tokio::time::interval(self.sample_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.poll_cycle().await {
                        Ok(()) => debug!("Poll cycle complete"),
                        Err(err) => error!("Poll cycle failed: {err}"),
                    }
                }
                () = shutdown.cancelled() => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }

    /// The engine driving each cycle.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The sink receiving reports.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directory::fake::{FakeDirectory, ScriptedConnector},
        engine::SNMP_DN,
        metric_spec::ScopeSpecs,
        sink::Report,
    };

    fn engine() -> Engine {
        let counters = [("total".to_string(), "Total Operations;ops".to_string())]
            .into_iter()
            .collect();
        Engine::new(ScopeSpecs::parse(&counters, &Default::default()).expect("bad specs"))
    }

    fn snmp(total: &str) -> FakeDirectory {
        FakeDirectory::new().with_entry(SNMP_DN, [("total", [total])])
    }

    fn counts(reports: &[Report]) -> Vec<f64> {
        reports
            .iter()
            .filter(|r| r.name.ends_with("/Count"))
            .map(|r| r.value)
            .collect()
    }

    #[tokio::test]
    async fn failed_cycles_are_reported_and_survived() {
        let connector = ScriptedConnector::new(
            [
                Ok(snmp("100")),
                Err(directory::Error::Transport("connection refused".to_string())),
                Ok(FakeDirectory::new().broken()),
                Ok(snmp("160")),
            ],
            true,
        );
        let mut agent = Agent::new(connector, engine(), Vec::<Report>::new(), Duration::from_secs(60));

        agent.poll_cycle().await.expect("first cycle failed");
        assert!(matches!(agent.poll_cycle().await, Err(Error::Connect(_))));
        assert!(matches!(
            agent.poll_cycle().await,
            Err(Error::Poll(engine::Error::Directory(directory::Error::Transport(_))))
        ));
        agent.poll_cycle().await.expect("last cycle failed");

        assert_eq!(counts(agent.sink()), vec![100.0, 160.0]);
        let last_rate = agent
            .sink()
            .iter()
            .rev()
            .find(|r| r.name.ends_with("/Rate"))
            .expect("no rate reported");
        assert!(last_rate.value > 0.0, "rate history lost: {last_rate:?}");
    }

    #[test]
    fn connector_decides_privilege() {
        let anonymous = Agent::new(
            ScriptedConnector::new([], true),
            engine().privileged(true),
            Vec::<Report>::new(),
            Duration::from_secs(60),
        );
        assert!(!anonymous.engine().is_privileged());

        let bound = Agent::new(
            ScriptedConnector::new([], false),
            engine(),
            Vec::<Report>::new(),
            Duration::from_secs(60),
        );
        assert!(bound.engine().is_privileged());
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_until_cancelled() {
        let connector = ScriptedConnector::new([Ok(snmp("1")), Ok(snmp("2")), Ok(snmp("3"))], true);
        let agent = Agent::new(connector, engine(), Vec::<Report>::new(), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(agent.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("agent did not stop")
            .expect("agent panicked");
    }
}
