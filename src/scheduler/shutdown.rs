//! Graceful shutdown on SIGINT/SIGTERM
//!
//! First signal: workers finish the strand they hold, release its lease
//! and exit. Second signal: exit immediately; leases simply expire.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit code when the pool was interrupted
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Shared stop flags
#[derive(Debug, Default)]
pub struct ShutdownState {
    stop_requested: AtomicBool,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

/// Action to take after a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Stop claiming work; let running strands reach a commit
    Drain,
    /// Give up now
    ImmediateExit,
    Ignore,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    /// Ask workers to stop without a signal (tests, `--once`).
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and decide what to do about it.
    pub fn handle_signal(&self) -> ShutdownAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        match count {
            0 => {
                self.stop_requested.store(true, Ordering::SeqCst);
                ShutdownAction::Drain
            }
            1 => {
                self.immediate_exit.store(true, Ordering::SeqCst);
                ShutdownAction::ImmediateExit
            }
            _ => ShutdownAction::Ignore,
        }
    }
}

/// Install the process signal handler for `state`.
///
/// Must be called at most once per process.
pub fn install(state: Arc<ShutdownState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        ShutdownAction::Drain => {
            tracing::warn!("interrupt received, draining workers");
        }
        ShutdownAction::ImmediateExit => {
            tracing::warn!("second interrupt received, exiting immediately");
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
        ShutdownAction::Ignore => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = ShutdownState::new();
        assert!(!state.is_stop_requested());
        assert!(!state.is_immediate_exit());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_first_signal_drains() {
        let state = ShutdownState::new();
        assert_eq!(state.handle_signal(), ShutdownAction::Drain);
        assert!(state.is_stop_requested());
        assert!(!state.is_immediate_exit());
    }

    #[test]
    fn test_second_signal_exits() {
        let state = ShutdownState::new();
        state.handle_signal();
        assert_eq!(state.handle_signal(), ShutdownAction::ImmediateExit);
        assert!(state.is_immediate_exit());
        assert_eq!(state.handle_signal(), ShutdownAction::Ignore);
        assert_eq!(state.signal_count(), 3);
    }

    #[test]
    fn test_request_stop() {
        let state = ShutdownState::new();
        state.request_stop();
        assert!(state.is_stop_requested());
        assert_eq!(state.signal_count(), 0);
    }
}
