//! Failure injection for the simulated provider
//!
//! Lets tests make a given provider operation fail a fixed number of times
//! (or forever) for one resource kind or for every kind.

use std::collections::HashMap;

use crate::error::ProviderError;
use crate::resource::ResourceKind;

/// Provider operations that can be failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Describe,
    Create,
    Delete,
    Modify,
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Error to return
    pub error: ProviderError,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    /// Always fail with `error`
    pub fn error(error: ProviderError) -> Self {
        Self {
            error,
            fail_count: None,
        }
    }

    /// Throttle the operation
    pub fn throttled() -> Self {
        Self::error(ProviderError::throttled())
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

type InjectionKey = (Operation, Option<ResourceKind>);

/// Failure injector for the simulated provider
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<InjectionKey, FailureConfig>,
    call_counts: HashMap<InjectionKey, u32>,
}

impl FailureInjector {
    /// Create a new failure injector
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation on one kind, or on every kind
    /// when `kind` is `None`.
    pub fn inject(&mut self, op: Operation, kind: Option<ResourceKind>, config: FailureConfig) {
        self.configs.insert((op, kind), config);
        self.call_counts.insert((op, kind), 0);
    }

    /// Clear all failure injections
    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    /// Check whether a call should fail.
    ///
    /// A kind-specific injection takes precedence over a wildcard one.
    pub fn check(&mut self, op: Operation, kind: ResourceKind) -> Option<ProviderError> {
        let key = if self.configs.contains_key(&(op, Some(kind))) {
            (op, Some(kind))
        } else {
            (op, None)
        };
        let config = self.configs.get(&key)?;

        let count = self.call_counts.entry(key).or_insert(0);
        *count += 1;

        match config.fail_count {
            Some(limit) if *count > limit => None,
            _ => Some(config.error.clone()),
        }
    }
}
