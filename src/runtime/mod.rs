//! Transition runtime
//!
//! [`transition`] holds the stack rules for hop/nap/pop/push, failure
//! backoff and cancellation. [`Executor`] drives a leased strand through
//! them, committing after every step.

pub mod transition;

mod executor;

pub use executor::{Executor, RunOutcome, RunReport};
pub use transition::{Failure, Transition};
