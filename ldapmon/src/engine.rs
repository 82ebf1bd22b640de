//! The poll cycle
//!
//! An [`Engine`] turns monitor entries into reports. Every scope runs the same
//! routine: walk a snapshot's attributes, match each against the scope's
//! counter and gauge tables, and report. Counters are reported twice, once as
//! a per-second rate and once as the raw count. Gauges are reported as read.
//!
//! Scopes are processed in a fixed order: server-wide, aggregate database,
//! backends, then the timed probes. The database and backend entries are only
//! read under a privileged bind. Entry-level failures skip the work depending
//! on that entry; a transport failure ends the cycle, keeping whatever was
//! already reported.
//!
//! Rate history is the engine's only state. It is kept per scope and survives
//! failed cycles.

use std::{collections::BTreeMap, time::Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{
    config::Config,
    directory::{self, AttributeSnapshot, Directory, MONITOR_DN, list_backends, read_entry},
    metric_spec::{self, Kind, ScopeSpecs},
    probe::Probes,
    rate::RateProcessor,
    sink::Sink,
};

/// Prefix of server-wide metrics.
pub const SERVER_PREFIX: &str = "LDAP";
/// Prefix of aggregate database metrics.
pub const DATABASE_PREFIX: &str = "Database";
/// Prefix of per-backend metrics.
pub const BACKEND_PREFIX: &str = "Backend";
/// Server-wide statistics entry.
pub const SNMP_DN: &str = "cn=snmp,cn=monitor";
/// Aggregate database statistics entry.
pub const DATABASE_MONITOR_DN: &str =
    "cn=database,cn=monitor,cn=ldbm database,cn=plugins,cn=config";
/// Base name of the per-file companion attributes on backend entries.
pub const FILENAME_ATTR: &str = "dbfilename";
/// Server-wide attribute absent from [`SNMP_DN`], read from [`MONITOR_DN`].
pub const READWAITERS_ATTR: &str = "readwaiters";

const RATE_SUFFIX: &str = "Rate";
const COUNT_SUFFIX: &str = "Count";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Engine`]
pub enum Error {
    /// The directory failed mid-cycle.
    #[error("Poll cycle aborted: {0}")]
    Directory(#[from] directory::Error),
}

/// Where one matched attribute is reported.
struct Target<'s> {
    kind: Kind,
    unit: &'s str,
    /// Metric name below the scope prefix
    name: String,
    /// Key of the attribute's rate history
    rate_key: String,
}

/// Polls one directory server.
#[derive(Debug, Default)]
pub struct Engine {
    server: ScopeSpecs,
    /// lower-cased server attribute -> entry it is read from
    entry_overrides: FxHashMap<String, String>,
    database: ScopeSpecs,
    backend: ScopeSpecs,
    probes: Probes,
    privileged: bool,
    server_rates: RateProcessor,
    database_rates: RateProcessor,
    backend_rates: RateProcessor,
}

impl Engine {
    /// Create an unprivileged [`Engine`] reporting the `server` scope only.
    ///
    /// `readwaiters` is read from [`MONITOR_DN`] unless overridden.
    #[must_use]
    pub fn new(server: ScopeSpecs) -> Self {
        let mut entry_overrides = FxHashMap::default();
        entry_overrides.insert(READWAITERS_ATTR.to_string(), MONITOR_DN.to_string());
        Self {
            server,
            entry_overrides,
            ..Self::default()
        }
    }

    /// Build an [`Engine`] from configuration.
    ///
    /// The engine is privileged whenever the connection binds with
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns the first invalid metric specification.
    pub fn from_config(config: &Config) -> Result<Self, metric_spec::Error> {
        let server = ScopeSpecs::parse(&config.server.counters, &config.server.gauges)?;
        let mut engine = Self::new(server);
        for (attribute, dn) in &config.server.entries {
            engine = engine.with_entry_override(attribute, dn);
        }
        if let Some(database) = &config.database {
            engine = engine.with_database(ScopeSpecs::from_config(database)?);
        }
        if let Some(backend) = &config.backend {
            engine = engine.with_backend(ScopeSpecs::from_config(backend)?);
        }
        let probes = Probes::from_config(config.timed_ops.as_ref(), config.connection.timeout());
        Ok(engine
            .with_probes(probes)
            .privileged(config.connection.credentials().is_some()))
    }

    /// Read server attribute `attribute` from `dn` instead of [`SNMP_DN`].
    /// An empty `dn` restores the default.
    #[must_use]
    pub fn with_entry_override(mut self, attribute: &str, dn: &str) -> Self {
        let attribute = attribute.to_lowercase();
        if dn.trim().is_empty() {
            self.entry_overrides.remove(&attribute);
        } else {
            self.entry_overrides.insert(attribute, dn.trim().to_string());
        }
        self
    }

    /// Report the aggregate database scope.
    #[must_use]
    pub fn with_database(mut self, database: ScopeSpecs) -> Self {
        self.database = database;
        self
    }

    /// Report the backend scope.
    #[must_use]
    pub fn with_backend(mut self, backend: ScopeSpecs) -> Self {
        self.backend = backend;
        self
    }

    /// Run `probes` at the end of every cycle.
    #[must_use]
    pub fn with_probes(mut self, probes: Probes) -> Self {
        self.probes = probes;
        self
    }

    /// Whether the bind may read privileged entries and modify.
    #[must_use]
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Whether the engine reads privileged entries.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Run one poll cycle against `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Directory`] on a transport failure. Reports made
    /// before the failure stand.
    pub async fn poll<D: Directory, S: Sink>(
        &mut self,
        directory: &mut D,
        sink: &mut S,
    ) -> Result<(), Error> {
        self.poll_at(directory, sink, Instant::now()).await
    }

    /// Run one poll cycle, timing rates as if observed at `now`.
    ///
    /// # Errors
    ///
    /// See [`Engine::poll`].
    pub async fn poll_at<D: Directory, S: Sink>(
        &mut self,
        directory: &mut D,
        sink: &mut S,
        now: Instant,
    ) -> Result<(), Error> {
        self.process_server(directory, sink, now).await?;
        if self.privileged {
            self.process_database(directory, sink, now).await?;
            self.process_backends(directory, sink, now).await?;
        } else {
            debug!("Anonymous bind, skipping database and backend metrics");
        }
        self.probes.run(directory, sink, self.privileged).await?;
        Ok(())
    }

    async fn process_server<D: Directory, S: Sink>(
        &mut self,
        directory: &mut D,
        sink: &mut S,
        now: Instant,
    ) -> Result<(), Error> {
        if let Some(snapshot) = read_skippable(directory, SNMP_DN).await? {
            apply(&snapshot, SERVER_PREFIX, &mut self.server_rates, now, sink, |attribute| {
                if self.entry_overrides.contains_key(attribute) {
                    return None;
                }
                flat_target(&self.server, attribute)
            });
        }

        let mut by_entry: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (attribute, dn) in &self.entry_overrides {
            if self.server.contains(attribute) {
                by_entry
                    .entry(dn.as_str())
                    .or_default()
                    .push(attribute.as_str());
            }
        }
        for (dn, attributes) in by_entry {
            let Some(snapshot) = read_skippable(directory, dn).await? else {
                continue;
            };
            apply(&snapshot, SERVER_PREFIX, &mut self.server_rates, now, sink, |attribute| {
                if !attributes.contains(&attribute) {
                    return None;
                }
                flat_target(&self.server, attribute)
            });
        }
        Ok(())
    }

    async fn process_database<D: Directory, S: Sink>(
        &mut self,
        directory: &mut D,
        sink: &mut S,
        now: Instant,
    ) -> Result<(), Error> {
        if self.database.is_empty() {
            return Ok(());
        }
        if let Some(snapshot) = read_skippable(directory, DATABASE_MONITOR_DN).await? {
            apply(&snapshot, DATABASE_PREFIX, &mut self.database_rates, now, sink, |attribute| {
                flat_target(&self.database, attribute)
            });
        }
        Ok(())
    }

    async fn process_backends<D: Directory, S: Sink>(
        &mut self,
        directory: &mut D,
        sink: &mut S,
        now: Instant,
    ) -> Result<(), Error> {
        if self.backend.is_empty() {
            return Ok(());
        }
        let backends = match list_backends(directory).await {
            Ok(backends) => backends,
            Err(err) if err.is_skippable() => {
                warn!("Backend discovery unavailable: {err}");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        for backend in &backends {
            let Some(name) = backend.name() else {
                warn!("Cannot derive a backend name from {dn}", dn = backend.dn());
                continue;
            };
            let Some(snapshot) = read_skippable(directory, backend.dn()).await? else {
                continue;
            };
            let files = file_index(&snapshot);
            apply(&snapshot, BACKEND_PREFIX, &mut self.backend_rates, now, sink, |attribute| {
                backend_target(&self.backend, name, &files, attribute)
            });
        }
        Ok(())
    }
}

/// Read `dn`, logging and skipping entry-level failures.
async fn read_skippable<D: Directory>(
    directory: &mut D,
    dn: &str,
) -> Result<Option<AttributeSnapshot>, Error> {
    match read_entry(directory, dn).await {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(err) if err.is_skippable() => {
            warn!("Skipping {dn}: {err}");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Report every attribute of `snapshot` that `resolve` maps to a target.
fn apply<'s, S: Sink>(
    snapshot: &AttributeSnapshot,
    prefix: &str,
    rates: &mut RateProcessor,
    now: Instant,
    sink: &mut S,
    mut resolve: impl FnMut(&str) -> Option<Target<'s>>,
) {
    for attribute in snapshot.names() {
        let Some(target) = resolve(attribute) else {
            continue;
        };
        let Some(value) = snapshot.numeric(attribute) else {
            continue;
        };
        let name = format!("{prefix}/{}", target.name);
        match target.kind {
            Kind::Counter => {
                let rate = rates.process(&target.rate_key, value, now);
                sink.report(
                    &format!("{name}/{RATE_SUFFIX}"),
                    &format!("{}/sec", target.unit),
                    rate,
                );
                sink.report(&format!("{name}/{COUNT_SUFFIX}"), target.unit, value as f64);
            }
            Kind::Gauge => sink.report(&name, target.unit, value as f64),
        }
    }
}

fn flat_target<'s>(specs: &'s ScopeSpecs, attribute: &str) -> Option<Target<'s>> {
    let (kind, spec) = specs.lookup(attribute)?;
    Some(Target {
        kind,
        unit: &spec.unit,
        name: spec.metric.clone(),
        rate_key: attribute.to_string(),
    })
}

fn backend_target<'s>(
    specs: &'s ScopeSpecs,
    backend: &str,
    files: &FxHashMap<&str, &str>,
    attribute: &str,
) -> Option<Target<'s>> {
    let (base, suffix) = split_suffix(attribute);
    if base == FILENAME_ATTR {
        return None;
    }
    let (kind, spec) = specs.lookup(base)?;
    let file = match suffix {
        Some(suffix) if spec.has_placeholder() => Some(files.get(suffix).copied().unwrap_or_else(
            || {
                warn!("{backend}: no {FILENAME_ATTR}-{suffix} for {attribute}, naming it {suffix}");
                suffix
            },
        )),
        _ => None,
    };
    let name = format!("{backend}/{}", spec.resolve(file));
    Some(Target {
        kind,
        unit: &spec.unit,
        rate_key: name.clone(),
        name,
    })
}

/// Split `dbfilecachehit-15` into `("dbfilecachehit", Some("15"))`.
fn split_suffix(attribute: &str) -> (&str, Option<&str>) {
    match attribute.rsplit_once('-') {
        Some((base, suffix))
            if !base.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (base, Some(suffix))
        }
        _ => (attribute, None),
    }
}

/// Numeric suffix -> file name, from the snapshot's filename companions.
fn file_index(snapshot: &AttributeSnapshot) -> FxHashMap<&str, &str> {
    snapshot
        .names()
        .into_iter()
        .filter_map(|attribute| {
            let (base, suffix) = split_suffix(attribute);
            if base != FILENAME_ATTR {
                return None;
            }
            let path = snapshot.first(attribute)?;
            Some((suffix?, file_name(path)))
        })
        .collect()
}

/// `userRoot/givenName.db4` names the file `givenName.db4`.
fn file_name(path: &str) -> &str {
    path.split_once('/').map_or(path, |(_, file)| file)
}
