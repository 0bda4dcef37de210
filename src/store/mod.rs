//! Strand persistence and leasing
//!
//! The store is the only coordination point between executors. It must
//! provide an atomic "claim if due and unleased" so that no strand is ever
//! run by two executors at once, whether they share a process or not.
//!
//! Backends:
//! - [`MemoryStrandStore`]: single process, for tests and embedding
//! - [`FileStrandStore`]: JSON files guarded by an advisory lock, shared
//!   by every process pointed at the same directory

mod file;
mod lock;
mod memory;

pub use file::FileStrandStore;
pub use lock::{LockError, LockResult, StoreLock};
pub use memory::MemoryStrandStore;

use chrono::{DateTime, Duration, Utc};
use std::io;

use crate::strand::{Strand, StrandError, SubjectChange, SubjectRecord};

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("strand not found: {0}")]
    NotFound(String),

    #[error("strand already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid strand record: {0}")]
    Invalid(#[from] StrandError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

/// Result of a step, written back by the executor that ran it.
#[derive(Debug)]
pub struct Commit<'a> {
    /// New strand state as computed by the executor
    pub strand: &'a Strand,
    /// Executor that must still hold the lease
    pub owner: &'a str,
    /// Wake signals the handler consumed
    pub signals_consumed: u32,
    /// Whether the executor acted on `cancel_requested`
    pub cancel_consumed: bool,
    /// Ledger edits the step made, replayed onto the stored subject record
    pub subject_changes: &'a [SubjectChange],
}

/// Outcome of [`StrandStore::commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Written. Carries the stored signal count, which includes signals
    /// that arrived while the step ran.
    Applied { semaphore_count: u32 },
    /// The lease expired or moved; nothing was written
    LeaseLost,
}

/// Persistence backend for strands and subject ledgers.
pub trait StrandStore: Send + Sync {
    /// Persist a new strand.
    fn insert(&self, strand: &Strand) -> StoreResult<()>;

    /// Load a strand.
    fn get(&self, id: &str) -> StoreResult<Option<Strand>>;

    /// All strands, oldest first.
    fn list(&self) -> StoreResult<Vec<Strand>>;

    /// Claim up to `limit` due, unleased strands for `owner` until
    /// `now + lease`. Earliest `scheduled_at` first.
    fn acquire_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<Strand>>;

    /// Extend `owner`'s lease. Returns false if the lease was lost.
    fn renew(&self, id: &str, owner: &str, now: DateTime<Utc>, lease: Duration)
        -> StoreResult<bool>;

    /// Drop `owner`'s lease. A lease held by someone else is left alone.
    fn release(&self, id: &str, owner: &str) -> StoreResult<()>;

    /// Write a step's result if `owner` still holds a live lease.
    fn commit(&self, commit: &Commit<'_>, now: DateTime<Utc>) -> StoreResult<CommitOutcome>;

    /// Apply an external change (signal, cancel, unstick) to a strand.
    fn modify(&self, id: &str, change: &mut dyn FnMut(&mut Strand)) -> StoreResult<Strand>;

    /// Load a subject ledger.
    fn subject(&self, subject_id: &str) -> StoreResult<Option<SubjectRecord>>;
}

/// Pick and lease claimable strands. Shared by every backend.
pub(crate) fn claim_due<'a>(
    candidates: impl Iterator<Item = &'a mut Strand>,
    owner: &str,
    now: DateTime<Utc>,
    lease: Duration,
    limit: usize,
) -> Vec<Strand> {
    let mut due: Vec<&mut Strand> = candidates.filter(|s| s.is_claimable(now)).collect();
    due.sort_by(|a, b| {
        a.scheduled_at
            .cmp(&b.scheduled_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    due.into_iter()
        .take(limit)
        .map(|strand| {
            if let Some(previous) = strand.lease_owner.as_deref() {
                tracing::info!(strand = %strand.id, previous, owner, "reclaiming expired lease");
            }
            strand.lease_owner = Some(owner.to_string());
            strand.lease_expires_at = Some(now + lease);
            strand.clone()
        })
        .collect()
}

/// Merge a commit into the stored record. Shared by every backend.
///
/// The executor owns position, schedule and outcome fields. Signals and
/// cancel requests may have arrived while the step ran, so those are
/// merged rather than overwritten, and a late arrival wakes the strand.
pub(crate) fn merge_commit(
    stored: &mut Strand,
    commit: &Commit<'_>,
    now: DateTime<Utc>,
) -> StoreResult<CommitOutcome> {
    if !stored.is_leased_by(commit.owner, now) {
        return Ok(CommitOutcome::LeaseLost);
    }
    commit.strand.validate()?;

    let seen_signals = commit.strand.semaphore_count + commit.signals_consumed;
    let signals_arrived = stored.semaphore_count > seen_signals;
    let remaining_signals = stored.semaphore_count.saturating_sub(commit.signals_consumed);
    let cancel_pending = stored.cancel_requested && !commit.cancel_consumed;
    let cancel_arrived = cancel_pending && !commit.strand.cancel_requested;
    let lease_owner = stored.lease_owner.take();
    let lease_expires_at = stored.lease_expires_at.take();

    *stored = commit.strand.clone();
    stored.semaphore_count = remaining_signals;
    stored.cancel_requested = cancel_pending;
    stored.lease_owner = lease_owner;
    stored.lease_expires_at = lease_expires_at;
    stored.updated_at = now;

    if signals_arrived || cancel_arrived {
        stored.wake(now);
    }
    Ok(CommitOutcome::Applied {
        semaphore_count: stored.semaphore_count,
    })
}

/// Replay a commit's ledger edits onto `current`. Returns the record to
/// write, or `None` if nothing changed.
pub(crate) fn replay_subject(
    current: Option<SubjectRecord>,
    commit: &Commit<'_>,
    now: DateTime<Utc>,
) -> Option<SubjectRecord> {
    if commit.subject_changes.is_empty() {
        return None;
    }
    let mut subject = current.unwrap_or_else(|| SubjectRecord::new(&commit.strand.subject_id));
    if !subject.apply(commit.subject_changes) {
        return None;
    }
    subject.updated_at = now;
    Some(subject)
}
