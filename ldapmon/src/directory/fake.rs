//! In-memory [`Directory`] for tests

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use rustc_hash::{FxHashMap, FxHashSet};

use super::{AttributeSnapshot, Connector, Directory, Error, SearchScope};

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDirectory {
    entries: FxHashMap<String, AttributeSnapshot>,
    denied: FxHashSet<String>,
    unreachable: FxHashSet<String>,
    broken: bool,
    /// DNs read through `read_entry` or `attribute_values`, in order
    pub(crate) reads: Vec<String>,
    /// `(dn, attribute, value)` of every modification, in order
    pub(crate) modifications: Vec<(String, String, String)>,
}

impl FakeDirectory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_entry<I, N, V>(mut self, dn: &str, attributes: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        self.entries
            .insert(dn.to_lowercase(), attributes.into_iter().collect());
        self
    }

    /// Reject reads and writes of `dn` as insufficient access.
    pub(crate) fn deny(mut self, dn: &str) -> Self {
        self.denied.insert(dn.to_lowercase());
        self
    }

    /// Fail reads of `dn` at the transport level.
    pub(crate) fn unreachable(mut self, dn: &str) -> Self {
        self.unreachable.insert(dn.to_lowercase());
        self
    }

    /// Fail every operation at the transport level.
    pub(crate) fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    fn lookup(&mut self, dn: &str) -> Result<&AttributeSnapshot, Error> {
        if self.broken {
            return Err(Error::Transport("connection reset by peer".to_string()));
        }
        let key = dn.to_lowercase();
        self.reads.push(key.clone());
        if self.unreachable.contains(&key) {
            return Err(Error::Transport(format!("timed out reading {dn}")));
        }
        if self.denied.contains(&key) {
            return Err(Error::EntryUnreadable(dn.to_string()));
        }
        self.entries
            .get(&key)
            .ok_or_else(|| Error::EntryNotFound(dn.to_string()))
    }
}

fn depth(dn: &str) -> usize {
    dn.split(',').count()
}

impl Directory for FakeDirectory {
    async fn read_entry(&mut self, dn: &str) -> Result<AttributeSnapshot, Error> {
        self.lookup(dn).cloned()
    }

    async fn attribute_values(&mut self, dn: &str, attribute: &str) -> Result<Vec<String>, Error> {
        let entry = self.lookup(dn)?;
        Ok(entry.values(attribute).map(<[String]>::to_vec).unwrap_or_default())
    }

    async fn search(
        &mut self,
        base: &str,
        _filter: &str,
        scope: SearchScope,
        _time_limit: Duration,
    ) -> Result<Vec<String>, Error> {
        if self.broken {
            return Err(Error::Transport("connection reset by peer".to_string()));
        }
        let base = base.to_lowercase();
        if !self.entries.contains_key(&base) {
            return Err(Error::EntryNotFound(base));
        }
        let suffix = format!(",{base}");
        let mut found: Vec<String> = self
            .entries
            .keys()
            .filter(|dn| match scope {
                SearchScope::Base => **dn == base,
                SearchScope::One => dn.ends_with(&suffix) && depth(dn) == depth(&base) + 1,
                SearchScope::Sub => **dn == base || dn.ends_with(&suffix),
            })
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }

    async fn modify_attribute(&mut self, dn: &str, attribute: &str, value: &str) -> Result<(), Error> {
        if self.broken {
            return Err(Error::Transport("connection reset by peer".to_string()));
        }
        let key = dn.to_lowercase();
        if self.denied.contains(&key) {
            return Err(Error::EntryUnreadable(dn.to_string()));
        }
        if !self.entries.contains_key(&key) {
            return Err(Error::EntryNotFound(dn.to_string()));
        }
        self.modifications
            .push((dn.to_string(), attribute.to_string(), value.to_string()));
        Ok(())
    }

    async fn close(self) -> Result<(), Error> {
        Ok(())
    }
}

/// Hands out a scripted sequence of connection attempts.
#[derive(Debug)]
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<Result<FakeDirectory, Error>>>,
    anonymous: bool,
}

impl ScriptedConnector {
    pub(crate) fn new(
        script: impl IntoIterator<Item = Result<FakeDirectory, Error>>,
        anonymous: bool,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            anonymous,
        }
    }
}

impl Connector for ScriptedConnector {
    type Directory = FakeDirectory;

    async fn connect(&self) -> Result<FakeDirectory, Error> {
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(Error::Transport("script exhausted".to_string())))
    }

    fn is_anonymous(&self) -> bool {
        self.anonymous
    }
}
