//! Timed operation probes
//!
//! Beyond reading monitor entries the agent can measure the directory from a
//! client's point of view: one search and one modify per poll cycle, each
//! timed by wall clock.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::{
    config,
    directory::{self, Directory, SearchScope},
    sink::Sink,
};

/// Prefix of every probe metric.
pub const TIMED_OPS_PREFIX: &str = "LDAP/TimedOps";
const MILLISECONDS: &str = "milliseconds";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Times a single search and counts its results
pub struct SearchProbe {
    base: String,
    filter: String,
    scope: SearchScope,
    time_limit: Duration,
}

impl SearchProbe {
    /// Create a new [`SearchProbe`]
    #[must_use]
    pub fn new(
        base: impl Into<String>,
        filter: impl Into<String>,
        scope: SearchScope,
        time_limit: Duration,
    ) -> Self {
        Self {
            base: base.into(),
            filter: filter.into(),
            scope,
            time_limit,
        }
    }

    /// Run the search, reporting `Search/Time` and `Search/Results`.
    ///
    /// # Errors
    ///
    /// Propagates the [`Directory`] error.
    pub async fn run<D: Directory, S: Sink>(
        &self,
        directory: &mut D,
        sink: &mut S,
    ) -> Result<(), directory::Error> {
        let start = Instant::now();
        let entries = directory
            .search(&self.base, &self.filter, self.scope, self.time_limit)
            .await?;
        let elapsed = start.elapsed();

        sink.report(
            &format!("{TIMED_OPS_PREFIX}/Search/Time"),
            MILLISECONDS,
            elapsed.as_millis() as f64,
        );
        sink.report(
            &format!("{TIMED_OPS_PREFIX}/Search/Results"),
            "entries",
            entries.len() as f64,
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Times a single attribute replace
pub struct ModifyProbe {
    dn: String,
    attribute: String,
}

impl ModifyProbe {
    /// Create a new [`ModifyProbe`]
    #[must_use]
    pub fn new(dn: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attribute: attribute.into(),
        }
    }

    /// Replace the attribute with a timestamped value, reporting
    /// `Modify/Time`.
    ///
    /// # Errors
    ///
    /// Propagates the [`Directory`] error.
    pub async fn run<D: Directory, S: Sink>(
        &self,
        directory: &mut D,
        sink: &mut S,
    ) -> Result<(), directory::Error> {
        let value = format!("ldapmon {}", chrono::Utc::now().to_rfc2822());

        let start = Instant::now();
        directory
            .modify_attribute(&self.dn, &self.attribute, &value)
            .await?;
        let elapsed = start.elapsed();

        sink.report(
            &format!("{TIMED_OPS_PREFIX}/Modify/Time"),
            MILLISECONDS,
            elapsed.as_millis() as f64,
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The configured probes
pub struct Probes {
    search: Option<SearchProbe>,
    modify: Option<ModifyProbe>,
}

impl Probes {
    /// Create a new [`Probes`]
    #[must_use]
    pub fn new(search: Option<SearchProbe>, modify: Option<ModifyProbe>) -> Self {
        Self { search, modify }
    }

    /// Build the enabled probes from configuration. Searches are bounded by
    /// `time_limit`.
    #[must_use]
    pub fn from_config(config: Option<&config::TimedOps>, time_limit: Duration) -> Self {
        let Some(config) = config else {
            return Self::default();
        };
        let search = config
            .search
            .as_ref()
            .filter(|search| search.is_enabled())
            .map(|search| SearchProbe::new(&search.base, search.filter(), search.scope, time_limit));
        let modify = config
            .modify
            .as_ref()
            .filter(|modify| modify.is_enabled())
            .map(|modify| ModifyProbe::new(&modify.dn, modify.attribute()));
        Self { search, modify }
    }

    /// Whether no probe is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.search.is_none() && self.modify.is_none()
    }

    /// Run the configured probes. The modify probe only runs when
    /// `privileged`.
    ///
    /// Failures confined to the probed entry are logged and skipped.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn run<D: Directory, S: Sink>(
        &self,
        directory: &mut D,
        sink: &mut S,
        privileged: bool,
    ) -> Result<(), directory::Error> {
        if let Some(search) = &self.search {
            skip_entry_errors(search.run(directory, sink).await, "search")?;
        }
        if let Some(modify) = &self.modify
            && privileged
        {
            skip_entry_errors(modify.run(directory, sink).await, "modify")?;
        }
        Ok(())
    }
}

fn skip_entry_errors(
    result: Result<(), directory::Error>,
    probe: &str,
) -> Result<(), directory::Error> {
    match result {
        Err(err) if err.is_skippable() => {
            warn!("Skipping timed {probe}: {err}");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{directory::fake::FakeDirectory, sink::Report};

    fn directory() -> FakeDirectory {
        FakeDirectory::new()
            .with_entry("dc=example,dc=com", [("dc", ["example"])])
            .with_entry("ou=people,dc=example,dc=com", [("ou", ["people"])])
            .with_entry("uid=a,ou=people,dc=example,dc=com", [("uid", ["a"])])
            .with_entry("uid=probe,dc=example,dc=com", [("uid", ["probe"])])
    }

    fn names(reports: &[Report]) -> Vec<&str> {
        reports.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn search_reports_time_and_results() {
        let mut directory = directory();
        let mut reports: Vec<Report> = Vec::new();
        let probe = SearchProbe::new(
            "dc=example,dc=com",
            "(objectClass=*)",
            SearchScope::Sub,
            Duration::from_secs(10),
        );
        probe.run(&mut directory, &mut reports).await.expect("search failed");

        assert_eq!(
            names(&reports),
            vec!["LDAP/TimedOps/Search/Time", "LDAP/TimedOps/Search/Results"]
        );
        assert_eq!(reports[0].unit, "milliseconds");
        assert!(reports[0].value >= 0.0);
        assert_eq!(reports[1].unit, "entries");
        assert_eq!(reports[1].value, 4.0);
    }

    #[tokio::test]
    async fn search_scope_is_honoured() {
        let mut directory = directory();
        let mut reports: Vec<Report> = Vec::new();
        SearchProbe::new("dc=example,dc=com", "(objectClass=*)", SearchScope::One, Duration::from_secs(1))
            .run(&mut directory, &mut reports)
            .await
            .expect("search failed");
        assert_eq!(reports[1].value, 2.0);
    }

    #[tokio::test]
    async fn modify_writes_timestamped_value() {
        let mut directory = directory();
        let mut reports: Vec<Report> = Vec::new();
        ModifyProbe::new("uid=probe,dc=example,dc=com", "internationalisdnnumber")
            .run(&mut directory, &mut reports)
            .await
            .expect("modify failed");

        assert_eq!(names(&reports), vec!["LDAP/TimedOps/Modify/Time"]);
        assert_eq!(reports[0].unit, "milliseconds");
        let (dn, attribute, value) = &directory.modifications[0];
        assert_eq!(dn, "uid=probe,dc=example,dc=com");
        assert_eq!(attribute, "internationalisdnnumber");
        assert!(value.starts_with("ldapmon "));
    }

    #[tokio::test]
    async fn modify_skipped_without_privilege() {
        let mut directory = directory();
        let mut reports: Vec<Report> = Vec::new();
        let probes = Probes::new(
            Some(SearchProbe::new("dc=example,dc=com", "(objectClass=*)", SearchScope::Base, Duration::from_secs(1))),
            Some(ModifyProbe::new("uid=probe,dc=example,dc=com", "description")),
        );
        probes.run(&mut directory, &mut reports, false).await.expect("probes failed");

        assert_eq!(
            names(&reports),
            vec!["LDAP/TimedOps/Search/Time", "LDAP/TimedOps/Search/Results"]
        );
        assert!(directory.modifications.is_empty());
    }

    #[tokio::test]
    async fn denied_modify_is_skipped_but_transport_failure_propagates() {
        let mut directory = directory().deny("uid=probe,dc=example,dc=com");
        let mut reports: Vec<Report> = Vec::new();
        let probes = Probes::new(None, Some(ModifyProbe::new("uid=probe,dc=example,dc=com", "description")));
        probes.run(&mut directory, &mut reports, true).await.expect("denied modify must be skipped");
        assert!(reports.is_empty());

        let mut broken = FakeDirectory::new().broken();
        let err = probes
            .run(&mut broken, &mut reports, true)
            .await
            .expect_err("transport failure must propagate");
        assert!(matches!(err, directory::Error::Transport(_)));
    }

    #[test]
    fn disabled_probes_from_config() {
        let timed_ops = config::TimedOps {
            search: Some(config::Search {
                base: " ".to_string(),
                filter: String::new(),
                scope: SearchScope::Sub,
            }),
            modify: Some(config::Modify {
                dn: "uid=probe,dc=example,dc=com".to_string(),
                attribute: String::new(),
            }),
        };
        let probes = Probes::from_config(Some(&timed_ops), Duration::from_secs(10));
        assert_eq!(
            probes,
            Probes::new(
                None,
                Some(ModifyProbe::new("uid=probe,dc=example,dc=com", "internationalisdnnumber"))
            )
        );
        assert!(Probes::from_config(None, Duration::from_secs(10)).is_empty());
    }
}
