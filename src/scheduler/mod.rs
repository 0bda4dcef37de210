//! Scheduler / dispatcher
//!
//! A [`Dispatcher`] claims a batch of due strands for one owner and hands
//! each to its [`Executor`]. A [`WorkerPool`] runs N dispatchers on their
//! own threads, each with its own owner id, until asked to stop.
//!
//! Mutual exclusion comes from the store lease alone; workers share no
//! locks of their own.

mod shutdown;

pub use shutdown::{install as install_signal_handler, ShutdownAction, ShutdownState, EXIT_CODE_INTERRUPTED};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use strand_provider::ResourceClient;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::prog::ProgRegistry;
use crate::runtime::{Executor, RunReport};
use crate::store::{StoreResult, StrandStore};

/// Generate an executor owner id
pub fn generate_owner_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Everything a worker needs, shared across the pool.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<dyn StrandStore>,
    pub registry: Arc<ProgRegistry>,
    pub client: Arc<dyn ResourceClient>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl Runtime {
    /// Executor for `owner`
    pub fn executor(&self, owner: impl Into<String>) -> Executor {
        Executor::new(
            owner,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.client),
            Arc::clone(&self.clock),
            self.config.clone(),
        )
    }

    pub fn dispatcher(&self, owner: impl Into<String>) -> Dispatcher {
        Dispatcher::new(self.executor(owner))
    }
}

/// Claims due strands for one owner and runs them.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    executor: Executor,
}

impl Dispatcher {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub fn owner(&self) -> &str {
        self.executor.owner()
    }

    /// Claim one batch and run every strand in it to its next suspension.
    ///
    /// An empty result means nothing was due. A strand whose run fails is
    /// logged and released so another poll can pick it up; the rest of the
    /// batch still runs.
    pub fn poll_once(&self) -> StoreResult<Vec<RunReport>> {
        let config = self.executor.config();
        let now = self.executor.clock().now();
        let batch = self.executor.store().acquire_due(
            self.owner(),
            now,
            config.lease(),
            config.batch_size,
        )?;

        if !batch.is_empty() {
            tracing::debug!(owner = %self.owner(), claimed = batch.len(), "claimed strands");
        }

        let mut reports = Vec::with_capacity(batch.len());
        for strand in batch {
            let id = strand.id.clone();
            match self.executor.run(strand) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(strand = %id, owner = %self.owner(), error = %e, "strand run failed");
                    if let Err(e) = self.executor.store().release(&id, self.owner()) {
                        tracing::warn!(strand = %id, error = %e, "release failed, lease left to expire");
                    }
                }
            }
        }
        Ok(reports)
    }

    /// Poll until nothing is due, at most `max_polls` times.
    pub fn run_until_idle(&self, max_polls: usize) -> StoreResult<Vec<RunReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_polls {
            let batch = self.poll_once()?;
            if batch.is_empty() {
                break;
            }
            reports.extend(batch);
        }
        Ok(reports)
    }
}

/// Worker threads polling a shared store
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    owners: Vec<String>,
    shutdown: Arc<ShutdownState>,
}

impl WorkerPool {
    /// Spawn `runtime.config.workers` workers.
    pub fn start(runtime: Runtime, shutdown: Arc<ShutdownState>) -> std::io::Result<Self> {
        let mut handles = Vec::new();
        let mut owners = Vec::new();

        for index in 0..runtime.config.workers {
            let owner = generate_owner_id();
            let dispatcher = runtime.dispatcher(owner.clone());
            let shutdown = Arc::clone(&shutdown);
            let idle = runtime.config.poll_interval();

            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", index))
                .spawn(move || worker_loop(dispatcher, shutdown, idle))?;

            handles.push(handle);
            owners.push(owner);
        }

        tracing::info!(workers = owners.len(), "worker pool started");
        Ok(Self {
            handles,
            owners,
            shutdown,
        })
    }

    pub fn owners(&self) -> &[String] {
        &self.owners
    }

    /// Ask every worker to stop after its current strand.
    pub fn stop(&self) {
        self.shutdown.request_stop();
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

fn worker_loop(dispatcher: Dispatcher, shutdown: Arc<ShutdownState>, idle: std::time::Duration) {
    tracing::debug!(owner = %dispatcher.owner(), "worker started");
    while !shutdown.is_stop_requested() {
        match dispatcher.poll_once() {
            Ok(reports) if !reports.is_empty() => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(owner = %dispatcher.owner(), error = %e, "poll failed");
            }
        }
        thread::sleep(idle);
    }
    tracing::debug!(owner = %dispatcher.owner(), "worker stopped");
}
