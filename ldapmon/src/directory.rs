//! Read access to a directory server's monitor entries
//!
//! The engine never speaks a wire protocol itself. It drives a [`Directory`],
//! an already-open and bound connection, through the handful of operations it
//! needs: read all attributes of one entry, read the values of one attribute,
//! run a search and replace an attribute value. [`ldap::LdapDirectory`] is the
//! production implementation.
//!
//! Failures are split the way the poll cycle cares about them. Transport
//! failures end the cycle. Unreadable and missing entries are expected under
//! anonymous binds or partial configurations and only skip the processing that
//! depends on them.

use std::{future::Future, num::ParseIntError, time::Duration};

use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::warn;

#[cfg(test)]
pub(crate) mod fake;
pub mod ldap;

/// Top-level monitor entry.
pub const MONITOR_DN: &str = "cn=monitor";
/// Attribute of [`MONITOR_DN`] listing every backend monitor entry.
pub const BACKEND_MONITOR_ATTR: &str = "backendmonitordn";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced by a [`Directory`]
pub enum Error {
    /// Connection level failure, including timeouts.
    #[error("Directory transport failure: {0}")]
    Transport(String),
    /// The bound identity may not read the entry.
    #[error("Entry {0} is not readable with the current bind")]
    EntryUnreadable(String),
    /// The entry does not exist.
    #[error("Entry {0} does not exist")]
    EntryNotFound(String),
}

impl Error {
    /// Whether the failure only concerns one entry and sibling processing may
    /// continue.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::EntryUnreadable(_) | Self::EntryNotFound(_))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Search scope
pub enum SearchScope {
    /// The base entry only.
    #[default]
    Base,
    /// Immediate children of the base entry.
    One,
    /// The base entry and all its descendants.
    Sub,
}

/// An open, bound directory connection.
pub trait Directory {
    /// Fetch every attribute of the entry `dn`.
    fn read_entry(
        &mut self,
        dn: &str,
    ) -> impl Future<Output = Result<AttributeSnapshot, Error>> + Send;

    /// Fetch the values of `attribute` on the entry `dn`. An absent attribute
    /// has no values.
    fn attribute_values(
        &mut self,
        dn: &str,
        attribute: &str,
    ) -> impl Future<Output = Result<Vec<String>, Error>> + Send;

    /// Search below `base`, returning the DNs of matching entries.
    fn search(
        &mut self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        time_limit: Duration,
    ) -> impl Future<Output = Result<Vec<String>, Error>> + Send;

    /// Replace every value of `attribute` on `dn` with `value`.
    fn modify_attribute(
        &mut self,
        dn: &str,
        attribute: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release the connection.
    fn close(self) -> impl Future<Output = Result<(), Error>> + Send
    where
        Self: Sized;
}

/// Opens [`Directory`] connections, one per poll cycle.
pub trait Connector {
    /// The connection type produced.
    type Directory: Directory + Send;

    /// Open and bind a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Directory, Error>> + Send;

    /// Whether connections are bound anonymously. Anonymous binds cannot read
    /// privileged monitor entries.
    fn is_anonymous(&self) -> bool;
}

/// Point-in-time attributes of one entry, keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSnapshot {
    attributes: FxHashMap<String, Vec<String>>,
}

impl AttributeSnapshot {
    /// Create an empty [`AttributeSnapshot`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `values` to attribute `name`.
    pub fn insert<N, V>(&mut self, name: N, values: V)
    where
        N: AsRef<str>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        self.attributes
            .entry(name.as_ref().to_lowercase())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }

    /// All values of `name`, ignoring case.
    #[must_use]
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.attributes
            .get(name)
            .or_else(|| self.attributes.get(&name.to_lowercase()))
            .map(Vec::as_slice)
    }

    /// First value of `name`, ignoring case.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// First value of `name` parsed as an integer.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the value is not an integer. `Ok(None)` if
    /// the attribute is absent or has no value.
    pub fn integer(&self, name: &str) -> Result<Option<i64>, ParseIntError> {
        self.first(name).map(|v| v.trim().parse()).transpose()
    }

    /// First value of `name` as an integer, logging and discarding values
    /// which do not parse.
    #[must_use]
    pub fn numeric(&self, name: &str) -> Option<i64> {
        match self.integer(name) {
            Ok(value) => value,
            Err(err) => {
                warn!("Forced to skip attribute {name}: {err}");
                None
            }
        }
    }

    /// Attribute names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.attributes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the snapshot holds no attribute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for AttributeSnapshot
where
    N: AsRef<str>,
    V: IntoIterator,
    V::Item: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for (name, values) in iter {
            snapshot.insert(name, values);
        }
        snapshot
    }
}

/// A backend monitor entry discovered on [`MONITOR_DN`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendDescriptor {
    dn: String,
}

impl BackendDescriptor {
    /// Create a new [`BackendDescriptor`] for the monitor entry `dn`
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self { dn: dn.into() }
    }

    /// The monitor entry DN.
    #[must_use]
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// The backend name, taken from the value of the second RDN.
    ///
    /// `cn=monitor,cn=userRoot,cn=ldbm database,cn=plugins,cn=config` names
    /// the `userRoot` backend. `None` if the DN has no second RDN.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        let rdn = self.dn.split(',').nth(1)?;
        let (_, value) = rdn.split_once('=')?;
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    }
}

/// Fetch every attribute of the entry `dn`.
///
/// # Errors
///
/// Propagates the [`Directory`] error.
pub async fn read_entry<D: Directory>(
    directory: &mut D,
    dn: &str,
) -> Result<AttributeSnapshot, Error> {
    directory.read_entry(dn).await
}

/// List the backend monitor entries advertised on [`MONITOR_DN`].
///
/// An advertised attribute without values yields no backends.
///
/// # Errors
///
/// [`Error::EntryUnreadable`] under binds which may not read the monitor
/// entry, otherwise propagates the [`Directory`] error.
pub async fn list_backends<D: Directory>(
    directory: &mut D,
) -> Result<Vec<BackendDescriptor>, Error> {
    let dns = directory
        .attribute_values(MONITOR_DN, BACKEND_MONITOR_ATTR)
        .await?;
    Ok(dns.into_iter().map(BackendDescriptor::new).collect())
}

#[cfg(test)]
mod tests {
    use super::fake::FakeDirectory;
    use super::*;

    #[test]
    fn snapshot_lowercases_names() {
        let snapshot: AttributeSnapshot = [("OpsInitiated", ["42"])].into_iter().collect();
        assert_eq!(snapshot.first("opsinitiated"), Some("42"));
        assert_eq!(snapshot.first("OPSINITIATED"), Some("42"));
        assert_eq!(snapshot.names(), vec!["opsinitiated"]);
    }

    #[test]
    fn snapshot_integer_values() {
        let snapshot: AttributeSnapshot = [
            ("entries", vec!["12"]),
            ("version", vec!["389-Directory/2.0"]),
            ("empty", vec![]),
        ]
        .into_iter()
        .collect();

        assert_eq!(snapshot.integer("entries"), Ok(Some(12)));
        assert!(snapshot.integer("version").is_err());
        assert_eq!(snapshot.numeric("version"), None);
        assert_eq!(snapshot.integer("empty"), Ok(None));
        assert_eq!(snapshot.integer("missing"), Ok(None));
    }

    #[test]
    fn backend_name_from_second_rdn() {
        let backend =
            BackendDescriptor::new("cn=monitor,cn=userRoot,cn=ldbm database,cn=plugins,cn=config");
        assert_eq!(backend.name(), Some("userRoot"));

        let spaced = BackendDescriptor::new("cn=monitor, cn=NetscapeRoot, cn=ldbm database");
        assert_eq!(spaced.name(), Some("NetscapeRoot"));

        assert_eq!(BackendDescriptor::new("cn=monitor").name(), None);
        assert_eq!(BackendDescriptor::new("cn=monitor,garbage").name(), None);
    }

    #[tokio::test]
    async fn list_backends_reads_monitor_attribute() {
        let mut directory = FakeDirectory::new().with_entry(
            MONITOR_DN,
            [(
                "backendMonitorDN",
                vec![
                    "cn=monitor,cn=userRoot,cn=ldbm database,cn=plugins,cn=config",
                    "cn=monitor,cn=NetscapeRoot,cn=ldbm database,cn=plugins,cn=config",
                ],
            )],
        );

        let backends = list_backends(&mut directory).await.expect("discovery failed");
        let names: Vec<_> = backends.iter().filter_map(BackendDescriptor::name).collect();
        assert_eq!(names, vec!["userRoot", "NetscapeRoot"]);
    }

    #[tokio::test]
    async fn list_backends_without_values_is_empty() {
        let mut directory =
            FakeDirectory::new().with_entry(MONITOR_DN, [("backendmonitordn", Vec::<&str>::new())]);
        let backends = list_backends(&mut directory).await.expect("discovery failed");
        assert!(backends.is_empty());
    }

    #[tokio::test]
    async fn list_backends_unreadable_monitor() {
        let mut directory = FakeDirectory::new()
            .with_entry(MONITOR_DN, [("backendmonitordn", ["cn=monitor,cn=userRoot"])])
            .deny(MONITOR_DN);
        let err = list_backends(&mut directory).await.expect_err("must fail");
        assert_eq!(err, Error::EntryUnreadable(MONITOR_DN.to_string()));
        assert!(err.is_skippable());
    }

    #[tokio::test]
    async fn read_entry_missing() {
        let mut directory = FakeDirectory::new();
        let err = read_entry(&mut directory, "cn=nope").await.expect_err("must fail");
        assert!(matches!(err, Error::EntryNotFound(_)));
        assert!(!Error::Transport("reset".to_string()).is_skippable());
    }
}
