//! Directive application
//!
//! Pure functions over a [`Strand`]: nothing here touches the store or the
//! provider, so every stack rule is unit tested in isolation.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::prog::{Directive, ProgRegistry, StepError};
use crate::strand::{Frame, Strand, StrandState};

/// Where a strand stands after a directive was applied
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Due now; the executor may keep going inline
    Continue,
    /// Rescheduled `seconds` from now
    Napped { seconds: u64 },
    /// Root frame popped
    Finished(Value),
}

/// Outcome of recording a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Retried after `delay_seconds`
    Retrying { delay_seconds: u64 },
    /// Marked stuck
    Stuck,
}

/// Apply `directive` to the active frame of `strand`.
///
/// On error the strand is left untouched.
pub fn apply(
    strand: &mut Strand,
    directive: Directive,
    registry: &ProgRegistry,
    now: DateTime<Utc>,
) -> Result<Transition, StepError> {
    let depth = strand.depth();
    let Some(active) = strand.active_frame() else {
        return Err(StepError::Validation(format!("strand {} has an empty stack", strand.id)));
    };
    let current_prog = active.prog_name.clone();

    let transition = match directive {
        Directive::Hop(label) => {
            registry.resolve(&current_prog, &label)?;
            if let Some(frame) = strand.active_frame_mut() {
                frame.label = label;
            }
            strand.scheduled_at = Some(now);
            Transition::Continue
        }

        Directive::Nap(seconds) => {
            let seconds_i64 = i64::try_from(seconds)
                .map_err(|_| StepError::Validation(format!("nap of {} seconds", seconds)))?;
            let wake_at = Duration::try_seconds(seconds_i64)
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| StepError::Validation(format!("nap of {} seconds", seconds)))?;
            strand.scheduled_at = Some(wake_at);
            Transition::Napped { seconds }
        }

        Directive::Pop(value) => {
            if depth > 1 {
                strand.stack.pop();
                if let Some(parent) = strand.active_frame_mut() {
                    parent.retval = Some(value);
                }
                strand.scheduled_at = Some(now);
                Transition::Continue
            } else {
                // The root frame stays on the stack as the final position.
                strand.state = StrandState::Finished;
                strand.exitval = Some(value.clone());
                strand.scheduled_at = None;
                Transition::Finished(value)
            }
        }

        Directive::Push {
            prog,
            label,
            locals,
            return_to,
        } => {
            registry.resolve(&prog, &label)?;
            registry.resolve(&current_prog, &return_to)?;
            if let Some(parent) = strand.active_frame_mut() {
                parent.label = return_to;
                parent.retval = None;
            }
            strand.stack.push(Frame::new(prog, label, locals));
            strand.scheduled_at = Some(now);
            Transition::Continue
        }
    };

    strand.attempts = 0;
    strand.last_error = None;
    strand.sync_position();
    Ok(transition)
}

/// Record a failed step: back off, or mark the strand stuck when the
/// error is fatal or retries are exhausted.
pub fn fail(
    strand: &mut Strand,
    error: &StepError,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Failure {
    strand.attempts = strand.attempts.saturating_add(1);
    strand.last_error = Some(error.to_string());

    if error.is_fatal() || policy.exhausted(strand.attempts) {
        strand.state = StrandState::Stuck;
        strand.scheduled_at = None;
        return Failure::Stuck;
    }

    let delay_seconds = policy.backoff(strand.attempts);
    strand.scheduled_at = Some(now + Duration::seconds(delay_seconds as i64));
    Failure::Retrying { delay_seconds }
}

/// Re-point a cancelled strand at its root prog's teardown label.
///
/// The stack collapses to the root frame, which keeps its locals.
pub fn begin_teardown(
    strand: &mut Strand,
    registry: &ProgRegistry,
    now: DateTime<Utc>,
) -> Result<&'static str, StepError> {
    let Some(root) = strand.root_frame() else {
        return Err(StepError::Validation(format!("strand {} has an empty stack", strand.id)));
    };
    let Some(prog) = registry.get(&root.prog_name) else {
        return Err(StepError::Validation(format!("unknown prog {}", root.prog_name)));
    };
    let Some(teardown) = prog.teardown_label() else {
        return Err(StepError::Validation(format!("prog {} has no teardown", prog.name())));
    };

    strand.stack.truncate(1);
    if let Some(root) = strand.active_frame_mut() {
        root.label = teardown.to_string();
        root.retval = None;
    }
    strand.cancel_requested = false;
    strand.attempts = 0;
    strand.last_error = None;
    strand.scheduled_at = Some(now);
    strand.sync_position();
    Ok(teardown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::{Handler, Prog, StepContext, StepResult};
    use crate::strand::Locals;
    use serde_json::json;

    fn noop(_: &mut StepContext<'_>) -> StepResult {
        Ok(Directive::nap(1))
    }

    fn registry() -> ProgRegistry {
        let mut registry = ProgRegistry::new();
        registry.register(
            Prog::new(
                "Outer",
                "start",
                vec![
                    ("start", noop as Handler),
                    ("after", noop as Handler),
                    ("teardown", noop as Handler),
                ],
            )
            .with_teardown("teardown"),
        );
        registry.register(Prog::new("Inner", "begin", vec![("begin", noop as Handler)]));
        registry
    }

    fn strand(now: DateTime<Utc>) -> Strand {
        Strand::new("Outer", "start", "subject-1", Locals::new(), now)
    }

    // === hop / nap ===

    #[test]
    fn test_hop_moves_label_and_is_due_now() {
        let now = Utc::now();
        let mut s = strand(now);
        s.attempts = 2;
        s.last_error = Some("earlier".into());

        let t = apply(&mut s, Directive::hop("after"), &registry(), now).unwrap();

        assert_eq!(t, Transition::Continue);
        assert_eq!(s.label, "after");
        assert_eq!(s.scheduled_at, Some(now));
        assert_eq!(s.attempts, 0);
        assert!(s.last_error.is_none());
    }

    #[test]
    fn test_hop_to_unknown_label_is_rejected() {
        let now = Utc::now();
        let mut s = strand(now);
        let before = s.clone();

        let err = apply(&mut s, Directive::hop("nowhere"), &registry(), now).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(s, before);
    }

    #[test]
    fn test_nap_reschedules() {
        let now = Utc::now();
        let mut s = strand(now);

        let t = apply(&mut s, Directive::nap(30), &registry(), now).unwrap();

        assert_eq!(t, Transition::Napped { seconds: 30 });
        assert_eq!(s.label, "start");
        assert_eq!(s.scheduled_at, Some(now + Duration::seconds(30)));
    }

    // === push / pop ===

    #[test]
    fn test_push_then_pop_delivers_value() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);

        let mut locals = Locals::new();
        locals.insert("n".into(), json!(1));
        apply(&mut s, Directive::push("Inner", "begin", locals, "after"), &registry, now).unwrap();

        assert_eq!(s.depth(), 2);
        assert_eq!(s.prog_name, "Inner");
        assert_eq!(s.label, "begin");
        assert_eq!(s.stack[0].label, "after");
        assert_eq!(s.active_frame().unwrap().local("n"), Some(&json!(1)));

        let t = apply(&mut s, Directive::pop("inner done"), &registry, now).unwrap();

        assert_eq!(t, Transition::Continue);
        assert_eq!(s.depth(), 1);
        assert_eq!(s.prog_name, "Outer");
        assert_eq!(s.label, "after");
        assert_eq!(s.active_frame().unwrap().retval, Some(json!("inner done")));
        assert_eq!(s.state, StrandState::Active);
    }

    #[test]
    fn test_push_with_bad_return_label_is_rejected() {
        let now = Utc::now();
        let mut s = strand(now);
        let result = apply(
            &mut s,
            Directive::push("Inner", "begin", Locals::new(), "missing"),
            &registry(),
            now,
        );
        assert!(result.is_err());
        assert_eq!(s.depth(), 1);
    }

    #[test]
    fn test_root_pop_finishes() {
        let now = Utc::now();
        let mut s = strand(now);

        let t = apply(&mut s, Directive::pop("all done"), &registry(), now).unwrap();

        assert_eq!(t, Transition::Finished(json!("all done")));
        assert!(s.is_finished());
        assert_eq!(s.exitval, Some(json!("all done")));
        assert!(s.scheduled_at.is_none());
        assert_eq!(s.depth(), 1);
        assert!(s.validate().is_ok());
    }

    // === failures ===

    #[test]
    fn test_fail_backs_off_then_sticks() {
        let now = Utc::now();
        let mut s = strand(now);
        let policy = RetryPolicy {
            base_seconds: 2,
            max_seconds: 5,
            max_attempts: 3,
        };
        let error = StepError::Transient("throttled".into());

        assert_eq!(fail(&mut s, &error, &policy, now), Failure::Retrying { delay_seconds: 2 });
        assert_eq!(s.scheduled_at, Some(now + Duration::seconds(2)));
        assert_eq!(fail(&mut s, &error, &policy, now), Failure::Retrying { delay_seconds: 4 });
        assert_eq!(fail(&mut s, &error, &policy, now), Failure::Stuck);

        assert!(s.is_stuck());
        assert_eq!(s.attempts, 3);
        assert!(s.scheduled_at.is_none());
        assert!(s.last_error.as_deref().unwrap().contains("throttled"));
    }

    #[test]
    fn test_validation_failure_sticks_immediately() {
        let now = Utc::now();
        let mut s = strand(now);
        let error = StepError::Validation("missing cidr".into());

        assert_eq!(fail(&mut s, &error, &RetryPolicy::default(), now), Failure::Stuck);
        assert_eq!(s.attempts, 1);
    }

    // === cancellation ===

    #[test]
    fn test_begin_teardown_collapses_stack() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);
        apply(&mut s, Directive::push("Inner", "begin", Locals::new(), "after"), &registry, now)
            .unwrap();
        s.cancel_requested = true;

        let label = begin_teardown(&mut s, &registry, now).unwrap();

        assert_eq!(label, "teardown");
        assert_eq!(s.depth(), 1);
        assert_eq!(s.prog_name, "Outer");
        assert_eq!(s.label, "teardown");
        assert!(!s.cancel_requested);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_begin_teardown_requires_teardown_label() {
        let now = Utc::now();
        let mut s = Strand::new("Inner", "begin", "subject-1", Locals::new(), now);
        assert!(begin_teardown(&mut s, &registry(), now).is_err());
    }
}
