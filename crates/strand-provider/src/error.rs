//! Error types for provider calls.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider error codes.
///
/// These are the codes the simulated provider emits and the codes the
/// workflows' not-found allow-lists are written against.
pub mod codes {
    pub const SUBNET_NOT_FOUND: &str = "InvalidSubnetID.NotFound";
    pub const NETWORK_INTERFACE_NOT_FOUND: &str = "InvalidNetworkInterfaceID.NotFound";
    pub const ALLOCATION_NOT_FOUND: &str = "InvalidAllocationID.NotFound";
    pub const ASSOCIATION_NOT_FOUND: &str = "InvalidAssociationID.NotFound";
    pub const REQUEST_LIMIT_EXCEEDED: &str = "RequestLimitExceeded";
    pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
    pub const ADDRESS_IN_USE: &str = "InvalidIPAddress.InUse";
    pub const DEPENDENCY_VIOLATION: &str = "DependencyViolation";
    pub const INVALID_PARAMETER: &str = "InvalidParameterValue";
    pub const MISSING_PARAMETER: &str = "MissingParameter";
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Timeouts, throttling, dependency still settling. Retry later.
    Transient,
    /// The referenced object does not exist.
    NotFound,
    /// The request itself is malformed. Retrying will not help.
    Validation,
    /// Anything else the provider reports as a server-side failure.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Error returned by a [`crate::ResourceClient`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} {code}: {message}")]
pub struct ProviderError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Provider-specific error code (see [`codes`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Result type for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    /// Create a new provider error.
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a TRANSIENT error.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    /// Create a NOT_FOUND error.
    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    /// Create a VALIDATION error.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    /// Create a FATAL error.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, code, message)
    }

    /// Throttling error, the most common transient failure.
    pub fn throttled() -> Self {
        Self::transient(codes::REQUEST_LIMIT_EXCEEDED, "request limit exceeded")
    }

    /// Whether a later retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::Fatal)
    }

    /// Whether this is a not-found error whose code is in `allowed`.
    ///
    /// Only exact code matches count. An empty allow-list never matches.
    pub fn is_not_found_in(&self, allowed: &[&str]) -> bool {
        self.kind == ErrorKind::NotFound && allowed.iter().any(|code| *code == self.code)
    }
}
