//! Per-subject resource ledger
//!
//! Records which provider objects a workflow has made for a subject (e.g.
//! the interface id of a NIC record), so a later teardown strand for the
//! same subject knows what to delete. Several strands may share a subject,
//! so a step commits the changes it made, not the whole record; the store
//! replays them onto its current copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provider ids recorded for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: String,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl SubjectRecord {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            resources: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.resources.get(key).map(String::as_str)
    }

    /// Record `value` under `key`. Returns true if anything changed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        let previous = self.resources.insert(key.into(), value.clone());
        previous.as_deref() != Some(value.as_str())
    }

    /// Forget `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.resources.remove(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Replay `changes` in order. Returns true if anything changed.
    pub fn apply(&mut self, changes: &[SubjectChange]) -> bool {
        let mut changed = false;
        for change in changes {
            changed |= match change {
                SubjectChange::Set { key, value } => self.set(key.as_str(), value.as_str()),
                SubjectChange::Remove { key } => self.remove(key),
            };
        }
        changed
    }
}

/// One edit a step made to a subject ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectChange {
    Set { key: String, value: String },
    Remove { key: String },
}
