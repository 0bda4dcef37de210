//! Initiation boundary
//!
//! What callers outside the executor may do to strands: start them, wake
//! them, read their status, cancel them and (as operators) unstick them.
//! None of these touch the lease; they are store-level edits that the
//! lease holder's next commit merges.

use std::sync::Arc;

use serde_json::Value;

use crate::clock::Clock;
use crate::prog::ProgRegistry;
use crate::store::{StoreError, StrandStore};
use crate::strand::{validate_identifier, Locals, Strand, StrandError, StrandId, StrandState, StrandStatus};

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors at the initiation boundary
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown prog: {0}")]
    UnknownProg(String),

    #[error("prog {prog} has no label {label}")]
    UnknownLabel { prog: String, label: String },

    #[error("prog {0} has no teardown label")]
    NoTeardown(String),

    #[error("strand not found: {0}")]
    NotFound(String),

    #[error("strand {0} already finished")]
    AlreadyFinished(String),

    #[error("strand {0} is not stuck")]
    NotStuck(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(#[from] StrandError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Starts and steers strands.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgRegistry>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn StrandStore>, registry: Arc<ProgRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    /// Start `prog` for `subject_id` at its initial label.
    ///
    /// `args` must be a JSON object (or null); it becomes the root
    /// frame's locals.
    pub fn start(&self, prog: &str, subject_id: &str, args: Value) -> EngineResult<StrandId> {
        let initial = self
            .registry
            .get(prog)
            .ok_or_else(|| EngineError::UnknownProg(prog.to_string()))?
            .initial_label();
        self.start_at(prog, initial, subject_id, args)
    }

    /// Start `prog` at its teardown label.
    pub fn start_teardown(&self, prog: &str, subject_id: &str, args: Value) -> EngineResult<StrandId> {
        let teardown = self
            .registry
            .get(prog)
            .ok_or_else(|| EngineError::UnknownProg(prog.to_string()))?
            .teardown_label()
            .ok_or_else(|| EngineError::NoTeardown(prog.to_string()))?;
        self.start_at(prog, teardown, subject_id, args)
    }

    /// Start `prog` at an arbitrary label.
    pub fn start_at(
        &self,
        prog: &str,
        label: &str,
        subject_id: &str,
        args: Value,
    ) -> EngineResult<StrandId> {
        let found = self
            .registry
            .get(prog)
            .ok_or_else(|| EngineError::UnknownProg(prog.to_string()))?;
        if !found.has_label(label) {
            return Err(EngineError::UnknownLabel {
                prog: prog.to_string(),
                label: label.to_string(),
            });
        }
        validate_identifier(subject_id)?;
        let locals = args_to_locals(args)?;

        let strand = Strand::new(prog, label, subject_id, locals, self.clock.now());
        self.store.insert(&strand)?;
        tracing::info!(strand = %strand.id, prog, label, subject = subject_id, "strand started");
        Ok(strand.id)
    }

    /// Add a wake signal and make the strand due now.
    pub fn signal(&self, id: &str) -> EngineResult<StrandStatus> {
        let now = self.clock.now();
        let strand = self.modify(id, |strand| {
            if strand.state == StrandState::Active {
                strand.semaphore_count = strand.semaphore_count.saturating_add(1);
                strand.wake(now);
                strand.updated_at = now;
            }
        })?;
        tracing::debug!(strand = %strand.id, semaphore = strand.semaphore_count, "signalled");
        Ok(strand.status())
    }

    pub fn status(&self, id: &str) -> EngineResult<StrandStatus> {
        Ok(self.get(id)?.status())
    }

    pub fn get(&self, id: &str) -> EngineResult<Strand> {
        self.store
            .get(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Every strand, oldest first
    pub fn list(&self) -> EngineResult<Vec<StrandStatus>> {
        Ok(self.store.list()?.iter().map(Strand::status).collect())
    }

    /// Request cancellation. The next dispatch re-points the strand to its
    /// prog's teardown label. A stuck strand is reactivated for this.
    pub fn cancel(&self, id: &str) -> EngineResult<StrandStatus> {
        let current = self.get(id)?;
        if current.is_finished() {
            return Err(EngineError::AlreadyFinished(id.to_string()));
        }
        let root_prog = current
            .root_frame()
            .map(|f| f.prog_name.clone())
            .unwrap_or_else(|| current.prog_name.clone());
        let has_teardown = self
            .registry
            .get(&root_prog)
            .is_some_and(|p| p.teardown_label().is_some());
        if !has_teardown {
            return Err(EngineError::NoTeardown(root_prog));
        }

        let now = self.clock.now();
        let strand = self.modify(id, |strand| {
            if strand.is_finished() {
                return;
            }
            strand.cancel_requested = true;
            if strand.is_stuck() {
                strand.state = StrandState::Active;
                strand.attempts = 0;
            }
            strand.wake(now);
            strand.updated_at = now;
        })?;

        if strand.is_finished() {
            return Err(EngineError::AlreadyFinished(id.to_string()));
        }
        tracing::info!(strand = %strand.id, "cancel requested");
        Ok(strand.status())
    }

    /// Operator action: re-activate a stuck strand at its current label.
    pub fn unstick(&self, id: &str) -> EngineResult<StrandStatus> {
        let now = self.clock.now();
        let mut was_stuck = false;
        let strand = self.modify(id, |strand| {
            was_stuck = strand.is_stuck();
            if was_stuck {
                strand.state = StrandState::Active;
                strand.attempts = 0;
                strand.scheduled_at = Some(now);
                strand.updated_at = now;
            }
        })?;

        if !was_stuck {
            return Err(EngineError::NotStuck(id.to_string()));
        }
        tracing::info!(strand = %strand.id, label = %strand.label, "unstuck");
        Ok(strand.status())
    }

    fn modify(&self, id: &str, mut change: impl FnMut(&mut Strand)) -> EngineResult<Strand> {
        match self.store.modify(id, &mut change) {
            Ok(strand) => Ok(strand),
            Err(StoreError::NotFound(_)) => Err(EngineError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

fn args_to_locals(args: Value) -> EngineResult<Locals> {
    match args {
        Value::Null => Ok(Locals::new()),
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(EngineError::InvalidArgs(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::progs::builtin_registry;
    use crate::store::MemoryStrandStore;
    use serde_json::json;

    fn engine() -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = Engine::new(
            Arc::new(MemoryStrandStore::new()),
            Arc::new(builtin_registry()),
            clock.clone(),
        );
        (engine, clock)
    }

    #[test]
    fn test_start_creates_root_frame() {
        let (engine, clock) = engine();
        let id = engine.start("Nic", "nic-1", json!({"cidr": "10.0.0.0/24"})).unwrap();

        let strand = engine.get(&id).unwrap();
        assert_eq!(strand.label, "create_primary_network_endpoint");
        assert_eq!(strand.scheduled_at, Some(clock.now()));
        assert_eq!(strand.root_frame().unwrap().local("cidr"), Some(&json!("10.0.0.0/24")));
    }

    #[test]
    fn test_start_rejects_bad_input() {
        let (engine, _) = engine();
        assert!(matches!(engine.start("Vm", "vm-1", Value::Null), Err(EngineError::UnknownProg(_))));
        assert!(matches!(engine.start("Nic", "../x", Value::Null), Err(EngineError::InvalidSubject(_))));
        assert!(matches!(engine.start("Nic", "nic-1", json!([1])), Err(EngineError::InvalidArgs(_))));
        assert!(matches!(
            engine.start_at("Nic", "nowhere", "nic-1", Value::Null),
            Err(EngineError::UnknownLabel { .. })
        ));
    }

    #[test]
    fn test_start_teardown() {
        let (engine, _) = engine();
        let id = engine.start_teardown("Nic", "nic-1", Value::Null).unwrap();
        assert_eq!(engine.status(&id).unwrap().label, "destroy");
    }

    #[test]
    fn test_signal_wakes_napping_strand() {
        let (engine, clock) = engine();
        let id = engine.start("Nic", "nic-1", json!({"cidr": "10.0.0.0/24"})).unwrap();
        engine
            .store()
            .modify(&id, &mut |s| s.scheduled_at = Some(clock.now() + chrono::Duration::seconds(60)))
            .unwrap();

        clock.advance_secs(5);
        let status = engine.signal(&id).unwrap();

        assert_eq!(status.scheduled_at, Some(clock.now()));
        assert_eq!(engine.get(&id).unwrap().semaphore_count, 1);
    }

    #[test]
    fn test_signal_unknown_strand() {
        let (engine, _) = engine();
        assert!(matches!(engine.signal("missing"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_cancel_sets_flag_and_reactivates_stuck() {
        let (engine, _) = engine();
        let id = engine.start("Nic", "nic-1", json!({"cidr": "10.0.0.0/24"})).unwrap();
        engine
            .store()
            .modify(&id, &mut |s| {
                s.state = StrandState::Stuck;
                s.scheduled_at = None;
            })
            .unwrap();

        let status = engine.cancel(&id).unwrap();
        assert!(status.cancel_requested);
        assert_eq!(status.state, StrandState::Active);
        assert!(status.scheduled_at.is_some());
    }

    #[test]
    fn test_cancel_finished_is_rejected() {
        let (engine, _) = engine();
        let id = engine.start("Nic", "nic-1", Value::Null).unwrap();
        engine
            .store()
            .modify(&id, &mut |s| s.state = StrandState::Finished)
            .unwrap();
        assert!(matches!(engine.cancel(&id), Err(EngineError::AlreadyFinished(_))));
    }

    #[test]
    fn test_unstick() {
        let (engine, clock) = engine();
        let id = engine.start("Nic", "nic-1", Value::Null).unwrap();
        assert!(matches!(engine.unstick(&id), Err(EngineError::NotStuck(_))));

        engine
            .store()
            .modify(&id, &mut |s| {
                s.state = StrandState::Stuck;
                s.attempts = 8;
                s.scheduled_at = None;
                s.last_error = Some("boom".into());
            })
            .unwrap();

        let status = engine.unstick(&id).unwrap();
        assert_eq!(status.state, StrandState::Active);
        assert_eq!(status.attempts, 0);
        assert_eq!(status.scheduled_at, Some(clock.now()));
        // Kept for the operator
        assert_eq!(status.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_list() {
        let (engine, _) = engine();
        engine.start("Nic", "nic-1", Value::Null).unwrap();
        engine.start("Nic", "nic-2", Value::Null).unwrap();
        assert_eq!(engine.list().unwrap().len(), 2);
    }
}
