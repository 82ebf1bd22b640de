//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    fs,
    io::{self, ErrorKind},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{directory::SearchScope, metric_spec};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for IO operations when reading config directory
    #[error("Failed to read config directory: {0}")]
    Io(#[from] std::io::Error),
    /// A metric specification is invalid.
    #[error("Invalid metric specification: {0}")]
    MetricSpec(#[from] metric_spec::Error),
    /// Error when no config files found in directory
    #[error("No .yaml config files found in directory: {0}")]
    NoConfigFiles(PathBuf),
    /// Error when a section is defined in multiple config files
    #[error("{0} cannot be defined in multiple config files")]
    Conflicting(&'static str),
    /// Error when a required section is defined in no config file
    #[error("{0} must be defined")]
    Missing(&'static str),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

fn default_sample_period() -> u64 {
    60_000
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    389
}

fn default_timeout() -> u64 {
    10_000
}

fn default_search_filter() -> String {
    "(objectClass=*)".to_string()
}

fn default_modify_attribute() -> String {
    "internationalisdnnumber".to_string()
}

/// Port conventionally serving LDAP over TLS.
pub const LDAPS_PORT: u16 = 636;

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name of this agent, defaults to `LDAP - <host>`
    #[serde(default)]
    pub name: Option<String>,
    /// The period on which the directory server is polled.
    #[serde(default = "default_sample_period")]
    pub sample_period_milliseconds: u64,
    /// How to reach the directory server
    #[serde(default)]
    pub connection: Connection,
    /// Server-wide monitor metrics
    pub server: Server,
    /// Aggregate database monitor metrics, privileged
    #[serde(default)]
    pub database: Option<metric_spec::Config>,
    /// Per-backend and per-file database metrics, privileged
    #[serde(default)]
    pub backend: Option<metric_spec::Config>,
    /// Timed search and modify probes
    #[serde(default)]
    pub timed_ops: Option<TimedOps>,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Telemetry,
}

impl Config {
    /// The agent name, falling back to `LDAP - <host>`.
    #[must_use]
    pub fn agent_name(&self) -> String {
        self.name
            .as_deref()
            .and_then(non_empty)
            .map_or_else(|| format!("LDAP - {}", self.connection.host), str::to_string)
    }

    /// The sample period as a [`Duration`].
    #[must_use]
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_milliseconds)
    }

    /// Parse every metric specification, surfacing malformed ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetricSpec`] for the first invalid specification.
    pub fn validate(&self) -> Result<(), Error> {
        metric_spec::ScopeSpecs::parse(&self.server.counters, &self.server.gauges)?;
        for scope in [&self.database, &self.backend].into_iter().flatten() {
            metric_spec::ScopeSpecs::from_config(scope)?;
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(s)
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Directory server connection parameters
pub struct Connection {
    /// Host name of the directory server
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the directory server
    #[serde(default = "default_port")]
    pub port: u16,
    /// DN to bind as, anonymous when unset or empty
    #[serde(default)]
    pub bind_dn: Option<String>,
    /// Password for `bind_dn`, anonymous when unset or empty
    #[serde(default)]
    pub bind_password: Option<String>,
    /// Connect over TLS, defaults to true on port 636
    #[serde(default)]
    pub use_tls: Option<bool>,
    /// Skip certificate verification
    #[serde(default)]
    pub trust_any_tls: bool,
    /// Connect and per-operation timeout
    #[serde(default = "default_timeout")]
    pub timeout_milliseconds: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bind_dn: None,
            bind_password: None,
            use_tls: None,
            trust_any_tls: false,
            timeout_milliseconds: default_timeout(),
        }
    }
}

impl Connection {
    /// Bind DN and password, `None` for an anonymous bind.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let dn = self.bind_dn.as_deref().and_then(non_empty)?;
        let password = self.bind_password.as_deref().and_then(non_empty)?;
        Some((dn, password))
    }

    /// Whether TLS is in use.
    #[must_use]
    pub fn uses_tls(&self) -> bool {
        self.use_tls.unwrap_or(self.port == LDAPS_PORT)
    }

    /// The connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.uses_tls() { "ldaps" } else { "ldap" };
        format!("{scheme}://{host}:{port}", host = self.host, port = self.port)
    }

    /// The timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_milliseconds)
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Server-wide metric specifications
///
/// Attributes are read off `cn=snmp,cn=monitor` unless `entries` names
/// another entry for them.
pub struct Server {
    /// `attribute -> "metric;unit"` for monotonic counters
    #[serde(default)]
    pub counters: FxHashMap<String, String>,
    /// `attribute -> "metric;unit"` for gauges
    #[serde(default)]
    pub gauges: FxHashMap<String, String>,
    /// `attribute -> DN` of the entry to read the attribute from
    #[serde(default)]
    pub entries: FxHashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Timed probe configuration
pub struct TimedOps {
    /// Timed search
    #[serde(default)]
    pub search: Option<Search>,
    /// Timed modify
    #[serde(default)]
    pub modify: Option<Modify>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Timed search probe
pub struct Search {
    /// Search base, the probe is disabled when empty
    #[serde(default)]
    pub base: String,
    /// Search filter
    #[serde(default = "default_search_filter")]
    pub filter: String,
    /// Search scope
    #[serde(default)]
    pub scope: SearchScope,
}

impl Search {
    /// The filter, falling back to `(objectClass=*)` when empty.
    #[must_use]
    pub fn filter(&self) -> &str {
        non_empty(&self.filter).unwrap_or("(objectClass=*)")
    }

    /// Whether the probe has a base to search.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        non_empty(&self.base).is_some()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Timed modify probe
pub struct Modify {
    /// Entry to modify, the probe is disabled when empty
    #[serde(default)]
    pub dn: String,
    /// Attribute to replace
    #[serde(default = "default_modify_attribute")]
    pub attribute: String,
}

impl Modify {
    /// The attribute, falling back to `internationalisdnnumber` when empty.
    #[must_use]
    pub fn attribute(&self) -> &str {
        non_empty(&self.attribute).unwrap_or("internationalisdnnumber")
    }

    /// Whether the probe has an entry to modify.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        non_empty(&self.dn).is_some()
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of ldapmon's telemetry.
pub enum Telemetry {
    /// In prometheus mode ldapmon will expose its metrics for scraping at a
    /// prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
    /// In prometheus socket mode ldapmon will expose its metrics for scraping
    /// on a unix socket.
    PrometheusSocket {
        /// Path of the socket for the prometheus exporter
        path: PathBuf,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::Prometheus {
            addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            global_labels: FxHashMap::default(),
        }
    }
}

/// Partial configuration used for merging multiple config files
///
/// All fields are optional to allow partial configs that only specify certain
/// sections. This is used internally for directory-based config overlay.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    /// Name of this agent.
    pub name: Option<String>,
    /// The period on which the directory server is polled.
    pub sample_period_milliseconds: Option<u64>,
    /// How to reach the directory server.
    pub connection: Option<Connection>,
    /// Server-wide monitor metrics.
    pub server: Option<Server>,
    /// Aggregate database monitor metrics.
    pub database: Option<metric_spec::Config>,
    /// Per-backend database metrics.
    pub backend: Option<metric_spec::Config>,
    /// Timed probes.
    pub timed_ops: Option<TimedOps>,
    /// The method by which to express telemetry.
    pub telemetry: Option<Telemetry>,
}

fn merge_singleton<T>(
    base: &mut Option<T>,
    overlay: Option<T>,
    section: &'static str,
) -> Result<(), Error> {
    match (base.is_some(), overlay) {
        (true, Some(_)) => Err(Error::Conflicting(section)),
        (false, Some(value)) => {
            *base = Some(value);
            Ok(())
        }
        (_, None) => Ok(()),
    }
}

impl Config {
    /// Create a Config from a `PartialConfig`, using defaults for missing fields
    ///
    /// # Errors
    ///
    /// Returns an error if the `server` section is missing.
    pub fn from_partial(partial: PartialConfig) -> Result<Self, Error> {
        Ok(Self {
            name: partial.name,
            sample_period_milliseconds: partial
                .sample_period_milliseconds
                .unwrap_or_else(default_sample_period),
            connection: partial.connection.unwrap_or_default(),
            server: partial.server.ok_or(Error::Missing("server"))?,
            database: partial.database,
            backend: partial.backend,
            timed_ops: partial.timed_ops,
            telemetry: partial.telemetry.unwrap_or_default(),
        })
    }

    /// Merge two `PartialConfig` instances together
    ///
    /// Every section is a singleton and may only be defined once across all
    /// partials. Ordering of config file reads does not matter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflicting`] if any section is defined in both.
    fn merge_partial(
        mut base: PartialConfig,
        overlay: PartialConfig,
    ) -> Result<PartialConfig, Error> {
        merge_singleton(&mut base.name, overlay.name, "name")?;
        merge_singleton(
            &mut base.sample_period_milliseconds,
            overlay.sample_period_milliseconds,
            "sample_period_milliseconds",
        )?;
        merge_singleton(&mut base.connection, overlay.connection, "connection")?;
        merge_singleton(&mut base.server, overlay.server, "server")?;
        merge_singleton(&mut base.database, overlay.database, "database")?;
        merge_singleton(&mut base.backend, overlay.backend, "backend")?;
        merge_singleton(&mut base.timed_ops, overlay.timed_ops, "timed_ops")?;
        merge_singleton(&mut base.telemetry, overlay.telemetry, "telemetry")?;
        Ok(base)
    }
}

/// Parse a configuration from YAML text.
///
/// # Errors
///
/// Returns an error if the YAML is invalid or any metric specification is
/// malformed.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a path (file or directory)
///
/// If the path points to a file, loads and parses that single config. If the
/// path points to a directory, composes all .yaml files by combining
/// them. Configs must be strictly disjoint. Load order doesn't affect the
/// result.
///
/// # Errors
///
/// Returns an error if:
///
/// * Path does not exist or cannot be read
/// * No .yaml files found in directory
/// * Config files contain invalid YAML or metric specifications
/// * Any section defined in multiple files
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let metadata = fs::metadata(path)?;

    if metadata.is_file() {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        parse(&contents)
    } else if metadata.is_dir() {
        load_directory_configs(path)
    } else {
        Err(Error::Io(io::Error::new(
            ErrorKind::InvalidInput,
            "Path is neither a file nor a directory",
        )))
    }
}

/// Load and compose all .yaml config files from a directory
///
/// # Errors
///
/// Returns an error if:
///
/// * Directory cannot be read
/// * No .yaml files found
/// * Any config file is invalid
/// * Any section defined in multiple files
fn load_directory_configs(dir: &Path) -> Result<Config, Error> {
    let mut merged = PartialConfig::default();
    let mut found_any = false;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        let is_yaml_file = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml");
        if !is_yaml_file {
            continue;
        }

        let contents = fs::read_to_string(&path).map_err(|source| Error::ReadFile {
            path: path.clone(),
            source: Box::new(source),
        })?;
        let partial: PartialConfig = serde_yaml::from_str(&contents)?;
        merged = Config::merge_partial(merged, partial)?;
        found_any = true;
    }

    if !found_any {
        return Err(Error::NoConfigFiles(dir.to_path_buf()));
    }

    let config = Config::from_partial(merged)?;
    config.validate()?;
    Ok(config)
}
