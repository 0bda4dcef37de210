//! In-memory strand store.
//!
//! One write lock covers every claim and commit, which gives the same
//! atomicity the file store gets from its directory lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use super::{
    claim_due, merge_commit, replay_subject, Commit, CommitOutcome, StoreError, StoreResult,
    StrandStore,
};
use crate::strand::{Strand, SubjectRecord};

/// Thread-safe in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStrandStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    strands: HashMap<String, Strand>,
    subjects: HashMap<String, SubjectRecord>,
}

impl MemoryStrandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a strand record as-is. Simulates a lost or stale write in
    /// tests; the engine never uses it.
    pub fn put_raw(&self, strand: Strand) {
        let mut inner = self.inner.write().unwrap();
        inner.strands.insert(strand.id.clone(), strand);
    }
}

impl StrandStore for MemoryStrandStore {
    fn insert(&self, strand: &Strand) -> StoreResult<()> {
        strand.validate()?;
        let mut inner = self.inner.write().unwrap();
        if inner.strands.contains_key(&strand.id) {
            return Err(StoreError::AlreadyExists(strand.id.clone()));
        }
        inner.strands.insert(strand.id.clone(), strand.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> StoreResult<Option<Strand>> {
        Ok(self.inner.read().unwrap().strands.get(id).cloned())
    }

    fn list(&self) -> StoreResult<Vec<Strand>> {
        let inner = self.inner.read().unwrap();
        let mut strands: Vec<Strand> = inner.strands.values().cloned().collect();
        strands.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(strands)
    }

    fn acquire_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<Strand>> {
        let mut inner = self.inner.write().unwrap();
        Ok(claim_due(inner.strands.values_mut(), owner, now, lease, limit))
    }

    fn renew(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().unwrap();
        let strand = inner
            .strands
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !strand.is_leased_by(owner, now) {
            return Ok(false);
        }
        strand.lease_expires_at = Some(now + lease);
        Ok(true)
    }

    fn release(&self, id: &str, owner: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(strand) = inner.strands.get_mut(id) {
            if strand.lease_owner.as_deref() == Some(owner) {
                strand.clear_lease();
            }
        }
        Ok(())
    }

    fn commit(&self, commit: &Commit<'_>, now: DateTime<Utc>) -> StoreResult<CommitOutcome> {
        let mut inner = self.inner.write().unwrap();
        let id = &commit.strand.id;
        let stored = inner
            .strands
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let outcome = merge_commit(stored, commit, now)?;
        if matches!(outcome, CommitOutcome::Applied { .. }) {
            let subject_id = &commit.strand.subject_id;
            let current = inner.subjects.get(subject_id).cloned();
            if let Some(subject) = replay_subject(current, commit, now) {
                inner.subjects.insert(subject_id.clone(), subject);
            }
        }
        Ok(outcome)
    }

    fn modify(&self, id: &str, change: &mut dyn FnMut(&mut Strand)) -> StoreResult<Strand> {
        let mut inner = self.inner.write().unwrap();
        let strand = inner
            .strands
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        change(strand);
        Ok(strand.clone())
    }

    fn subject(&self, subject_id: &str) -> StoreResult<Option<SubjectRecord>> {
        Ok(self.inner.read().unwrap().subjects.get(subject_id).cloned())
    }
}
