//! Strand engine - durable workflows for cloud resource provisioning
//!
//! Workflows ("progs") are tables of labelled steps. A running instance
//! ("strand") persists its position as an explicit frame stack, so any
//! executor can resume it after a crash. Executors claim due strands
//! through time-bounded leases in the store, run one label at a time and
//! commit after every step. Steps that touch the provider are written to
//! be re-run safely.

pub mod clock;
pub mod config;
pub mod engine;
pub mod idempotency;
pub mod prog;
pub mod progs;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod strand;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, RetryPolicy};
pub use engine::{Engine, EngineError, EngineResult};
pub use prog::{Directive, Handler, Prog, ProgRegistry, StepContext, StepError, StepResult};
pub use runtime::{Executor, RunOutcome, RunReport};
pub use scheduler::{Dispatcher, Runtime, ShutdownState, WorkerPool};
pub use store::{
    CommitOutcome, FileStrandStore, MemoryStrandStore, StoreError, StoreResult, StrandStore,
};
pub use strand::{
    Frame, Locals, Strand, StrandId, StrandState, StrandStatus, SubjectChange, SubjectRecord,
};
