//! Persisted strand record
//!
//! A strand is one running instance of a prog bound to a subject. Its
//! position is an explicit stack of frames (innermost last) so that it can
//! be serialized, survive restarts and be resumed by any executor.
//!
//! Strand states: ACTIVE → {FINISHED | STUCK}, with STUCK → ACTIVE on
//! operator unstick.

mod frame;
mod subject;

pub use frame::{Frame, Locals};
pub use subject::{SubjectChange, SubjectRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version for persisted strand records
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "strand-engine/strand@1";

/// Strand identifier (lowercase ULID)
pub type StrandId = String;

/// Generate a new strand id
pub fn generate_strand_id() -> StrandId {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Validate a strand or subject identifier.
///
/// Identifiers end up in file names: ^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$
pub fn validate_identifier(id: &str) -> Result<(), StrandError> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && id.len() <= 128
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StrandError::InvalidIdentifier(id.to_string()))
    }
}

/// Lifecycle state of a strand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrandState {
    /// Scheduled or running
    Active,
    /// Needs operator attention; never dispatched
    Stuck,
    /// Root frame popped; never dispatched again
    Finished,
}

/// Errors for strand records
#[derive(Debug, thiserror::Error)]
pub enum StrandError {
    #[error("strand {0} has an empty stack")]
    EmptyStack(String),

    #[error("strand {id} position {prog}/{label} does not match its active frame")]
    PositionMismatch {
        id: String,
        prog: String,
        label: String,
    },

    #[error("strand {0} has a lease owner without an expiry")]
    IncompleteLease(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Persisted strand record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    pub schema_version: u32,
    pub schema_id: String,

    pub id: StrandId,

    /// Prog of the active frame
    pub prog_name: String,

    /// Label of the active frame
    pub label: String,

    /// Call stack, innermost last
    pub stack: Vec<Frame>,

    /// Earliest time the strand may run; None when not schedulable
    pub scheduled_at: Option<DateTime<Utc>>,

    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Pending wake signals
    #[serde(default)]
    pub semaphore_count: u32,

    /// Resource entity this strand drives
    pub subject_id: String,

    pub state: StrandState,

    /// Value of the final root pop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitval: Option<Value>,

    /// Consecutive failed step executions
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strand {
    /// Create a strand whose root frame starts at `label`, due at `now`.
    pub fn new(
        prog_name: impl Into<String>,
        label: impl Into<String>,
        subject_id: impl Into<String>,
        locals: Locals,
        now: DateTime<Utc>,
    ) -> Self {
        let root = Frame::new(prog_name, label, locals);
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            id: generate_strand_id(),
            prog_name: root.prog_name.clone(),
            label: root.label.clone(),
            stack: vec![root],
            scheduled_at: Some(now),
            lease_owner: None,
            lease_expires_at: None,
            semaphore_count: 0,
            subject_id: subject_id.into(),
            state: StrandState::Active,
            exitval: None,
            attempts: 0,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The active (innermost) frame
    pub fn active_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn active_frame_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    /// The bottom frame, where the strand was started
    pub fn root_frame(&self) -> Option<&Frame> {
        self.stack.first()
    }

    /// Stack depth
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Copy the active frame's position into `prog_name`/`label`.
    pub fn sync_position(&mut self) {
        if let Some(frame) = self.stack.last() {
            self.prog_name = frame.prog_name.clone();
            self.label = frame.label.clone();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == StrandState::Finished
    }

    pub fn is_stuck(&self) -> bool {
        self.state == StrandState::Stuck
    }

    /// Active and scheduled at or before `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == StrandState::Active && self.scheduled_at.is_some_and(|at| at <= now)
    }

    /// Some executor holds an unexpired lease
    pub fn lease_held(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// `owner` holds an unexpired lease
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_deref() == Some(owner) && self.lease_held(now)
    }

    /// Eligible for `acquire_due`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.lease_held(now)
    }

    pub fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// Make the strand due no later than `now`.
    pub fn wake(&mut self, now: DateTime<Utc>) {
        if self.state == StrandState::Active {
            self.scheduled_at = Some(self.scheduled_at.map_or(now, |at| at.min(now)));
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), StrandError> {
        let Some(frame) = self.stack.last() else {
            return Err(StrandError::EmptyStack(self.id.clone()));
        };
        if frame.prog_name != self.prog_name || frame.label != self.label {
            return Err(StrandError::PositionMismatch {
                id: self.id.clone(),
                prog: self.prog_name.clone(),
                label: self.label.clone(),
            });
        }
        if self.lease_owner.is_some() && self.lease_expires_at.is_none() {
            return Err(StrandError::IncompleteLease(self.id.clone()));
        }
        Ok(())
    }

    /// Snapshot for the initiation boundary
    pub fn status(&self) -> StrandStatus {
        StrandStatus {
            id: self.id.clone(),
            prog_name: self.prog_name.clone(),
            label: self.label.clone(),
            subject_id: self.subject_id.clone(),
            state: self.state,
            terminal: self.is_finished(),
            stuck: self.is_stuck(),
            last_error: self.last_error.clone(),
            exitval: self.exitval.clone(),
            attempts: self.attempts,
            depth: self.depth(),
            scheduled_at: self.scheduled_at,
            leased_by: self.lease_owner.clone(),
            cancel_requested: self.cancel_requested,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// What callers of the engine see about a strand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrandStatus {
    pub id: StrandId,
    pub prog_name: String,
    pub label: String,
    pub subject_id: String,
    pub state: StrandState,
    pub terminal: bool,
    pub stuck: bool,
    pub last_error: Option<String>,
    pub exitval: Option<Value>,
    pub attempts: u32,
    pub depth: usize,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub cancel_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn strand() -> Strand {
        Strand::new("Nic", "start", "nic-1", Locals::new(), Utc::now())
    }

    #[test]
    fn test_new_strand() {
        let s = strand();
        assert_eq!(s.state, StrandState::Active);
        assert_eq!(s.depth(), 1);
        assert_eq!(s.prog_name, "Nic");
        assert_eq!(s.label, "start");
        assert_eq!(s.schema_version, SCHEMA_VERSION);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_ids_are_unique_and_valid() {
        let a = generate_strand_id();
        let b = generate_strand_id();
        assert_ne!(a, b);
        assert!(validate_identifier(&a).is_ok());
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("nic-1").is_ok());
        assert!(validate_identifier("vm_2.eth0").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("-leading").is_err());
        assert!(validate_identifier("../escape").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_due_and_lease() {
        let mut s = strand();
        let now = s.scheduled_at.unwrap();
        assert!(s.is_due(now));
        assert!(s.is_claimable(now));

        s.lease_owner = Some("worker-a".to_string());
        s.lease_expires_at = Some(now + Duration::seconds(60));
        assert!(s.lease_held(now));
        assert!(s.is_leased_by("worker-a", now));
        assert!(!s.is_leased_by("worker-b", now));
        assert!(!s.is_claimable(now));

        // Expired leases are abandoned
        let later = now + Duration::seconds(61);
        assert!(!s.lease_held(later));
        assert!(s.is_claimable(later));
    }

    #[test]
    fn test_finished_is_never_due() {
        let mut s = strand();
        let now = s.scheduled_at.unwrap();
        s.state = StrandState::Finished;
        assert!(!s.is_due(now));
    }

    #[test]
    fn test_wake_only_moves_earlier() {
        let mut s = strand();
        let now = s.scheduled_at.unwrap();
        s.scheduled_at = Some(now + Duration::seconds(30));
        s.wake(now);
        assert_eq!(s.scheduled_at, Some(now));

        s.wake(now + Duration::seconds(10));
        assert_eq!(s.scheduled_at, Some(now));
    }

    #[test]
    fn test_validate_catches_empty_stack() {
        let mut s = strand();
        s.stack.clear();
        assert!(matches!(s.validate(), Err(StrandError::EmptyStack(_))));
    }

    #[test]
    fn test_validate_catches_position_mismatch() {
        let mut s = strand();
        s.label = "elsewhere".to_string();
        assert!(matches!(
            s.validate(),
            Err(StrandError::PositionMismatch { .. })
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let s = strand();
        let json = s.to_json().unwrap();
        assert!(json.contains("\"state\": \"active\""));
        let parsed = Strand::from_json(&json).unwrap();
        assert_eq!(parsed, s);
    }
}
