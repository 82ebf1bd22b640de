//! LDAP v3 [`Directory`]
//!
//! Connections are opened with a connect timeout, optionally over TLS, and
//! bound either with the configured simple credentials or anonymously. Every
//! operation is bounded by the same timeout.

use std::{collections::HashSet, fmt, time::Duration};

use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod, Scope, SearchEntry,
    SearchOptions,
};
use tracing::{debug, warn};

use super::{AttributeSnapshot, Connector, Directory, Error, SearchScope};
use crate::config;

/// `noSuchObject` result code
const NO_SUCH_OBJECT: u32 = 32;
/// `insufficientAccessRights` result code
const INSUFFICIENT_ACCESS_RIGHTS: u32 = 50;

const ALL_ENTRIES: &str = "(objectClass=*)";
const ALL_USER_ATTRIBUTES: &str = "*";
const NO_ATTRIBUTES: &str = "1.1";

/// An open LDAP connection.
pub struct LdapDirectory {
    ldap: Ldap,
    timeout: Duration,
}

impl fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LdapDirectory {
    /// Open a connection described by `config` and bind it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the server cannot be reached in time or
    /// rejects the bind.
    pub async fn connect(config: &config::Connection) -> Result<Self, Error> {
        let url = config.url();
        let timeout = config.timeout();
        let settings = LdapConnSettings::new()
            .set_conn_timeout(timeout)
            .set_no_tls_verify(config.trust_any_tls);

        let identity = config.credentials().map_or("ANON", |(dn, _)| dn);
        debug!("Connecting {identity} @ {url} ...");

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                warn!("LDAP connection to {url} ended with error: {err}");
            }
        });

        if let Some((dn, password)) = config.credentials() {
            ldap.with_timeout(timeout)
                .simple_bind(dn, password)
                .await
                .and_then(LdapResult::success)
                .map_err(|err| Error::Transport(format!("bind as {dn} failed: {err}")))?;
        }

        Ok(Self { ldap, timeout })
    }

    async fn base_entry(
        &mut self,
        dn: &str,
        attributes: &[&str],
    ) -> Result<SearchEntry, Error> {
        let (entries, _) = self
            .ldap
            .with_timeout(self.timeout)
            .search(dn, Scope::Base, ALL_ENTRIES, attributes.to_vec())
            .await
            .and_then(ldap3::SearchResult::success)
            .map_err(|err| classify(dn, err))?;
        entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or_else(|| Error::EntryNotFound(dn.to_string()))
    }
}

/// Map an LDAP failure on `dn` into the poll cycle's error taxonomy.
fn classify(dn: &str, err: LdapError) -> Error {
    match err {
        LdapError::LdapResult { result } if result.rc == NO_SUCH_OBJECT => {
            Error::EntryNotFound(dn.to_string())
        }
        LdapError::LdapResult { result } if result.rc == INSUFFICIENT_ACCESS_RIGHTS => {
            Error::EntryUnreadable(dn.to_string())
        }
        other => Error::Transport(other.to_string()),
    }
}

fn scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::One => Scope::OneLevel,
        SearchScope::Sub => Scope::Subtree,
    }
}

impl Directory for LdapDirectory {
    async fn read_entry(&mut self, dn: &str) -> Result<AttributeSnapshot, Error> {
        let entry = self.base_entry(dn, &[ALL_USER_ATTRIBUTES]).await?;
        Ok(entry.attrs.into_iter().collect())
    }

    async fn attribute_values(&mut self, dn: &str, attribute: &str) -> Result<Vec<String>, Error> {
        let entry = self.base_entry(dn, &[attribute]).await?;
        Ok(entry
            .attrs
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values)
            .unwrap_or_default())
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        search_scope: SearchScope,
        time_limit: Duration,
    ) -> Result<Vec<String>, Error> {
        let seconds = i32::try_from(time_limit.as_secs().max(1)).unwrap_or(i32::MAX);
        let (entries, _) = self
            .ldap
            .with_search_options(SearchOptions::new().timelimit(seconds))
            .with_timeout(time_limit)
            .search(base, scope(search_scope), filter, vec![NO_ATTRIBUTES])
            .await
            .and_then(ldap3::SearchResult::success)
            .map_err(|err| classify(base, err))?;
        Ok(entries
            .into_iter()
            .map(|entry| SearchEntry::construct(entry).dn)
            .collect())
    }

    async fn modify_attribute(&mut self, dn: &str, attribute: &str, value: &str) -> Result<(), Error> {
        let replace = Mod::Replace(attribute, HashSet::from([value]));
        self.ldap
            .with_timeout(self.timeout)
            .modify(dn, vec![replace])
            .await
            .and_then(LdapResult::success)
            .map_err(|err| classify(dn, err))?;
        Ok(())
    }

    async fn close(mut self) -> Result<(), Error> {
        self.ldap
            .unbind()
            .await
            .map_err(|err| Error::Transport(err.to_string()))
    }
}

/// Opens an [`LdapDirectory`] per poll cycle.
#[derive(Debug, Clone)]
pub struct LdapConnector {
    config: config::Connection,
}

impl LdapConnector {
    /// Create a new [`LdapConnector`]
    #[must_use]
    pub fn new(config: config::Connection) -> Self {
        Self { config }
    }
}

impl Connector for LdapConnector {
    type Directory = LdapDirectory;

    async fn connect(&self) -> Result<LdapDirectory, Error> {
        LdapDirectory::connect(&self.config).await
    }

    fn is_anonymous(&self) -> bool {
        self.config.credentials().is_none()
    }
}
