//! File-backed strand store.
//!
//! Layout:
//!
//! ```text
//! <root>/.strand_store.lock
//! <root>/strands/<strand_id>.json
//! <root>/subjects/<subject_id>.json
//! ```
//!
//! Records are written atomically (write-then-rename). Every operation
//! that reads and then writes holds the store lock for its duration, so
//! several processes can share one directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use super::lock::StoreLock;
use super::{
    claim_due, merge_commit, replay_subject, Commit, CommitOutcome, StoreError, StoreResult,
    StrandStore,
};
use crate::strand::{validate_identifier, Strand, SubjectRecord};

/// Default time to wait for the store lock
const DEFAULT_LOCK_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Strand store persisted as JSON files under one directory.
#[derive(Debug, Clone)]
pub struct FileStrandStore {
    root: PathBuf,
    lock_timeout: StdDuration,
}

impl FileStrandStore {
    /// Open (and create if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("strands"))?;
        fs::create_dir_all(root.join("subjects"))?;
        Ok(Self {
            root,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Change how long operations wait for the store lock.
    pub fn with_lock_timeout(mut self, timeout: StdDuration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> StoreResult<StoreLock> {
        Ok(StoreLock::acquire(&self.root, self.lock_timeout)?)
    }

    fn strand_path(&self, id: &str) -> StoreResult<PathBuf> {
        validate_identifier(id)?;
        Ok(self.root.join("strands").join(format!("{}.json", id)))
    }

    fn subject_path(&self, subject_id: &str) -> StoreResult<PathBuf> {
        validate_identifier(subject_id)?;
        Ok(self.root.join("subjects").join(format!("{}.json", subject_id)))
    }

    fn read_strand(&self, id: &str) -> StoreResult<Option<Strand>> {
        let path = self.strand_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(Strand::from_json(&json)?))
    }

    fn write_strand(&self, strand: &Strand) -> StoreResult<()> {
        let path = self.strand_path(&strand.id)?;
        write_atomic(&path, &strand.to_json()?)
    }

    fn read_all(&self) -> StoreResult<Vec<Strand>> {
        let mut strands = Vec::new();
        for entry in fs::read_dir(self.root.join("strands"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read_to_string(&path)?;
            strands.push(Strand::from_json(&json)?);
        }
        strands.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(strands)
    }

    fn update<T>(
        &self,
        id: &str,
        change: impl FnOnce(&mut Strand) -> StoreResult<(T, bool)>,
    ) -> StoreResult<T> {
        let _lock = self.lock()?;
        let mut strand = self
            .read_strand(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (result, dirty) = change(&mut strand)?;
        if dirty {
            self.write_strand(&strand)?;
        }
        Ok(result)
    }
}

/// Write to a temp file then rename over `path`.
fn write_atomic(path: &Path, contents: &str) -> StoreResult<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

impl StrandStore for FileStrandStore {
    fn insert(&self, strand: &Strand) -> StoreResult<()> {
        strand.validate()?;
        let _lock = self.lock()?;
        if self.strand_path(&strand.id)?.exists() {
            return Err(StoreError::AlreadyExists(strand.id.clone()));
        }
        self.write_strand(strand)
    }

    fn get(&self, id: &str) -> StoreResult<Option<Strand>> {
        // Renames are atomic, so reads need no lock.
        self.read_strand(id)
    }

    fn list(&self) -> StoreResult<Vec<Strand>> {
        self.read_all()
    }

    fn acquire_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<Strand>> {
        let _lock = self.lock()?;
        let mut strands = self.read_all()?;
        let claimed = claim_due(strands.iter_mut(), owner, now, lease, limit);
        for strand in &claimed {
            self.write_strand(strand)?;
        }
        Ok(claimed)
    }

    fn renew(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<bool> {
        self.update(id, |strand| {
            if !strand.is_leased_by(owner, now) {
                return Ok((false, false));
            }
            strand.lease_expires_at = Some(now + lease);
            Ok((true, true))
        })
    }

    fn release(&self, id: &str, owner: &str) -> StoreResult<()> {
        match self.update(id, |strand| {
            let mine = strand.lease_owner.as_deref() == Some(owner);
            if mine {
                strand.clear_lease();
            }
            Ok(((), mine))
        }) {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    fn commit(&self, commit: &Commit<'_>, now: DateTime<Utc>) -> StoreResult<CommitOutcome> {
        let _lock = self.lock()?;
        let id = &commit.strand.id;
        let mut stored = self
            .read_strand(id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let outcome = merge_commit(&mut stored, commit, now)?;
        if matches!(outcome, CommitOutcome::Applied { .. }) {
            // Subject first: a crash in between leaves the ledger ahead of
            // the strand, and re-running the step is idempotent.
            let current = self.subject(&stored.subject_id)?;
            if let Some(subject) = replay_subject(current, commit, now) {
                let path = self.subject_path(&subject.subject_id)?;
                write_atomic(&path, &serde_json::to_string_pretty(&subject)?)?;
            }
            self.write_strand(&stored)?;
        }
        Ok(outcome)
    }

    fn modify(&self, id: &str, change: &mut dyn FnMut(&mut Strand)) -> StoreResult<Strand> {
        self.update(id, |strand| {
            change(strand);
            Ok((strand.clone(), true))
        })
    }

    fn subject(&self, subject_id: &str) -> StoreResult<Option<SubjectRecord>> {
        let path = self.subject_path(subject_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}
