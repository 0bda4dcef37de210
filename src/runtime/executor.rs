//! Step executor
//!
//! Runs one leased strand forward: one label handler per step, one store
//! commit per step. Stops at the first suspension point (nap, backoff,
//! root pop, stuck), after `max_steps_per_lease` inline steps, or as soon
//! as the lease is lost.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use strand_provider::ResourceClient;

use super::transition::{self, Failure, Transition};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::prog::{ProgRegistry, StepContext, StepEffects, StepError};
use crate::store::{Commit, CommitOutcome, StoreResult, StrandStore};
use crate::strand::{Strand, StrandId, SubjectRecord};

/// Why an executor stopped working a strand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Waiting on a nap
    Napped,
    /// Waiting out a retry backoff
    Retrying,
    /// Root frame popped
    Finished,
    /// Needs an operator
    Stuck,
    /// Step budget for this lease used up; still due
    Yielded,
    /// Another executor owns the strand now
    LeaseLost,
}

/// Summary of one [`Executor::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub strand_id: StrandId,
    pub steps: u32,
    pub outcome: RunOutcome,
    /// Position when the executor stopped
    pub prog_name: String,
    pub label: String,
}

enum StepOutcome {
    Continue,
    Stop(RunOutcome),
}

/// Runs leased strands against a provider client.
#[derive(Clone)]
pub struct Executor {
    owner: String,
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgRegistry>,
    client: Arc<dyn ResourceClient>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Executor {
    pub fn new(
        owner: impl Into<String>,
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgRegistry>,
        client: Arc<dyn ResourceClient>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            owner: owner.into(),
            store,
            registry,
            client,
            clock,
            config,
        }
    }

    /// Lease owner id
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Work a strand this executor has leased until it suspends.
    ///
    /// The lease is released afterwards unless it was lost.
    pub fn run(&self, mut strand: Strand) -> StoreResult<RunReport> {
        let lease = self.config.lease();
        let mut steps = 0;

        let outcome = loop {
            if steps >= self.config.max_steps_per_lease {
                break RunOutcome::Yielded;
            }

            let now = self.clock.now();
            let expires = strand.lease_expires_at.unwrap_or(now);
            if expires - now < lease / 2 {
                if !self.store.renew(&strand.id, &self.owner, now, lease)? {
                    tracing::warn!(strand = %strand.id, owner = %self.owner, "lease lost before step");
                    break RunOutcome::LeaseLost;
                }
                strand.lease_expires_at = Some(now + lease);
            }

            steps += 1;
            match self.step(&mut strand, now)? {
                StepOutcome::Continue => continue,
                StepOutcome::Stop(outcome) => break outcome,
            }
        };

        if outcome != RunOutcome::LeaseLost {
            self.store.release(&strand.id, &self.owner)?;
        }

        tracing::debug!(
            strand = %strand.id,
            owner = %self.owner,
            steps,
            ?outcome,
            label = %strand.label,
            "strand run complete"
        );

        Ok(RunReport {
            strand_id: strand.id,
            steps,
            outcome,
            prog_name: strand.prog_name,
            label: strand.label,
        })
    }

    /// Run one label and commit its result.
    fn step(&self, strand: &mut Strand, now: DateTime<Utc>) -> StoreResult<StepOutcome> {
        let mut cancel_consumed = false;
        if strand.cancel_requested {
            cancel_consumed = true;
            match transition::begin_teardown(strand, &self.registry, now) {
                Ok(label) => {
                    tracing::info!(strand = %strand.id, label, "cancel requested, starting teardown");
                }
                Err(e) => {
                    tracing::warn!(strand = %strand.id, error = %e, "ignoring cancel request");
                    strand.cancel_requested = false;
                }
            }
        }

        let mut subject = self
            .store
            .subject(&strand.subject_id)?
            .unwrap_or_else(|| SubjectRecord::new(&strand.subject_id));

        let prog_name = strand.prog_name.clone();
        let label = strand.label.clone();

        let (result, effects) = match self.registry.resolve(&prog_name, &label) {
            Ok(handler) => {
                let mut ctx = StepContext::new(
                    strand,
                    self.client.as_ref(),
                    &mut subject,
                    now,
                    self.config.nap_poll_seconds,
                );
                let result = handler(&mut ctx);
                (result, Some(ctx.finish()))
            }
            Err(e) => (Err(e), None),
        };
        let StepEffects {
            signals_taken,
            subject_changes,
        } = effects.unwrap_or_default();

        let (outcome, signals_consumed) = match result
            .and_then(|directive| {
                tracing::debug!(strand = %strand.id, prog = %prog_name, label = %label, directive = directive.name(), "step");
                transition::apply(strand, directive, &self.registry, now)
            }) {
            Ok(transition) => {
                strand.semaphore_count = strand.semaphore_count.saturating_sub(signals_taken);
                let outcome = match transition {
                    Transition::Continue => StepOutcome::Continue,
                    Transition::Napped { .. } => StepOutcome::Stop(RunOutcome::Napped),
                    Transition::Finished(value) => {
                        tracing::info!(strand = %strand.id, prog = %prog_name, exitval = %value, "strand finished");
                        StepOutcome::Stop(RunOutcome::Finished)
                    }
                };
                (outcome, signals_taken)
            }
            Err(error) => (self.record_failure(strand, &prog_name, &label, &error, now), 0),
        };

        let commit = Commit {
            strand,
            owner: &self.owner,
            signals_consumed,
            cancel_consumed,
            subject_changes: &subject_changes,
        };
        match self.store.commit(&commit, now)? {
            CommitOutcome::Applied { semaphore_count } => {
                strand.semaphore_count = semaphore_count;
                strand.updated_at = now;
                Ok(outcome)
            }
            CommitOutcome::LeaseLost => {
                tracing::warn!(
                    strand = %strand.id,
                    owner = %self.owner,
                    prog = %prog_name,
                    label = %label,
                    "lease lost, discarding step result"
                );
                Ok(StepOutcome::Stop(RunOutcome::LeaseLost))
            }
        }
    }

    fn record_failure(
        &self,
        strand: &mut Strand,
        prog_name: &str,
        label: &str,
        error: &StepError,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        match transition::fail(strand, error, &self.config.retry, now) {
            Failure::Retrying { delay_seconds } => {
                tracing::warn!(
                    strand = %strand.id,
                    prog = %prog_name,
                    label = %label,
                    attempts = strand.attempts,
                    delay_seconds,
                    error = %error,
                    "step failed, backing off"
                );
                StepOutcome::Stop(RunOutcome::Retrying)
            }
            Failure::Stuck => {
                tracing::error!(
                    strand = %strand.id,
                    prog = %prog_name,
                    label = %label,
                    attempts = strand.attempts,
                    error = %error,
                    "step failed, strand is stuck"
                );
                StepOutcome::Stop(RunOutcome::Stuck)
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
