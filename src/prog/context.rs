//! Everything a label handler may read or touch.

use chrono::{DateTime, Utc};
use serde_json::Value;
use strand_provider::ResourceClient;

use super::StepError;
use crate::strand::{Strand, SubjectChange, SubjectRecord};

/// Input to one label invocation.
///
/// The strand is read-only here; handlers change it only through the
/// directive they return. The subject ledger is writable; the edits are
/// recorded and committed with the step.
pub struct StepContext<'a> {
    strand: &'a Strand,
    client: &'a dyn ResourceClient,
    subject: &'a mut SubjectRecord,
    subject_changes: Vec<SubjectChange>,
    now: DateTime<Utc>,
    poll_seconds: u64,
    signals_taken: u32,
}

/// Side effects of a step besides its directive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StepEffects {
    pub signals_taken: u32,
    pub subject_changes: Vec<SubjectChange>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        strand: &'a Strand,
        client: &'a dyn ResourceClient,
        subject: &'a mut SubjectRecord,
        now: DateTime<Utc>,
        poll_seconds: u64,
    ) -> Self {
        Self {
            strand,
            client,
            subject,
            subject_changes: Vec::new(),
            now,
            poll_seconds,
            signals_taken: 0,
        }
    }

    pub fn strand_id(&self) -> &str {
        &self.strand.id
    }

    pub fn subject_id(&self) -> &str {
        &self.strand.subject_id
    }

    pub fn prog_name(&self) -> &str {
        &self.strand.prog_name
    }

    pub fn label(&self) -> &str {
        &self.strand.label
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn client(&self) -> &dyn ResourceClient {
        self.client
    }

    /// Seconds a wait label naps between status checks.
    pub fn poll_interval(&self) -> u64 {
        self.poll_seconds
    }

    /// Argument of the active frame
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.strand.active_frame().and_then(|f| f.local(name))
    }

    /// String argument of the active frame; missing or non-string is a
    /// validation error.
    pub fn local_str(&self, name: &str) -> Result<&str, StepError> {
        self.local(name)
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::Validation(format!("missing string argument {:?}", name)))
    }

    /// Value deposited by the last child frame's pop
    pub fn retval(&self) -> Option<&Value> {
        self.strand.active_frame().and_then(|f| f.retval.as_ref())
    }

    /// Provider id recorded for this subject under `key`
    pub fn recall(&self, key: &str) -> Option<&str> {
        self.subject.get(key)
    }

    /// Record a provider id for this subject.
    pub fn remember(&mut self, key: &str, value: &str) {
        if self.subject.set(key, value) {
            self.subject_changes.push(SubjectChange::Set {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
    }

    /// Drop a provider id once it has been deleted.
    pub fn forget(&mut self, key: &str) {
        if self.subject.remove(key) {
            self.subject_changes.push(SubjectChange::Remove {
                key: key.to_string(),
            });
        }
    }

    /// Consume one pending wake signal, if any.
    pub fn take_signal(&mut self) -> bool {
        if self.signals_taken < self.strand.semaphore_count {
            self.signals_taken += 1;
            true
        } else {
            false
        }
    }

    /// Signals still pending for this step
    pub fn pending_signals(&self) -> u32 {
        self.strand.semaphore_count - self.signals_taken
    }

    pub(crate) fn finish(self) -> StepEffects {
        StepEffects {
            signals_taken: self.signals_taken,
            subject_changes: self.subject_changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::Locals;
    use serde_json::json;
    use strand_provider::MemoryProvider;

    fn strand() -> Strand {
        let mut locals = Locals::new();
        locals.insert("cidr".to_string(), json!("10.0.0.0/24"));
        locals.insert("count".to_string(), json!(2));
        let mut s = Strand::new("Nic", "start", "nic-1", locals, Utc::now());
        s.semaphore_count = 1;
        s
    }

    #[test]
    fn test_locals() {
        let s = strand();
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        let ctx = StepContext::new(&s, &provider, &mut subject, Utc::now(), 1);

        assert_eq!(ctx.local_str("cidr").unwrap(), "10.0.0.0/24");
        assert!(matches!(ctx.local_str("count"), Err(StepError::Validation(_))));
        assert!(matches!(ctx.local_str("zone"), Err(StepError::Validation(_))));
        assert!(ctx.retval().is_none());
    }

    #[test]
    fn test_signals_are_counted() {
        let s = strand();
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        let mut ctx = StepContext::new(&s, &provider, &mut subject, Utc::now(), 1);

        assert!(ctx.take_signal());
        assert!(!ctx.take_signal());
        assert_eq!(ctx.pending_signals(), 0);
        assert_eq!(ctx.finish().signals_taken, 1);
    }

    #[test]
    fn test_ledger_changes_are_tracked() {
        let s = strand();
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        subject.set("subnet_id", "subnet-1");

        let mut ctx = StepContext::new(&s, &provider, &mut subject, Utc::now(), 1);
        ctx.remember("subnet_id", "subnet-1");
        ctx.forget("missing");
        assert!(ctx.finish().subject_changes.is_empty());

        let mut ctx = StepContext::new(&s, &provider, &mut subject, Utc::now(), 1);
        ctx.remember("network_interface_id", "eni-1");
        ctx.forget("subnet_id");
        assert_eq!(ctx.recall("network_interface_id"), Some("eni-1"));
        assert_eq!(
            ctx.finish().subject_changes,
            vec![
                SubjectChange::Set {
                    key: "network_interface_id".to_string(),
                    value: "eni-1".to_string(),
                },
                SubjectChange::Remove {
                    key: "subnet_id".to_string(),
                },
            ]
        );
        assert_eq!(subject.get("network_interface_id"), Some("eni-1"));
    }
}
