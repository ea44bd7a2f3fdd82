//! # Error Types
//!
//! Domain-specific error types for scanlink-core, plus the failure taxonomy
//! every other crate maps its errors onto.
//!
//! ## Failure Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Classes                                   │
//! │                                                                         │
//! │  TransientNetwork    hub/registry unreachable, timeout, 5xx            │
//! │                      → retried with exponential backoff                 │
//! │                                                                         │
//! │  TransientLocal      store full or near capacity, disk hiccup          │
//! │                      → retried sooner, operator alerted                 │
//! │                                                                         │
//! │  PermanentRejection  payload or identity refused                       │
//! │                      → never retried, kept for operator review          │
//! │                                                                         │
//! │  ConfigurationFatal  missing credential material, no hardware id       │
//! │                      → agent refuses to start                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Class
// =============================================================================

/// How a failure must be handled, independent of where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network-side failure; retry with backoff.
    TransientNetwork,

    /// Local resource pressure; retry sooner and alert.
    TransientLocal,

    /// Input or identity refused; never retry.
    PermanentRejection,

    /// Agent cannot run with this configuration.
    ConfigurationFatal,
}

impl ErrorClass {
    /// Returns true if an operation failing with this class may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork | ErrorClass::TransientLocal
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::TransientNetwork => write!(f, "transient_network"),
            ErrorClass::TransientLocal => write!(f, "transient_local"),
            ErrorClass::PermanentRejection => write!(f, "permanent_rejection"),
            ErrorClass::ConfigurationFatal => write!(f, "configuration_fatal"),
        }
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Domain logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// None of the stable hardware attributes could be read.
    ///
    /// ## When This Occurs
    /// - Container without `/etc/machine-id` and no network interfaces
    /// - Board without a CPU serial and all MACs zeroed
    ///
    /// A random id is never substituted: a reflashed device must come back
    /// with the id the registry already knows.
    #[error("No stable hardware attributes available to derive a device id")]
    NoHardwareIdentity,

    /// Registration state would move backwards.
    #[error("Illegal registration transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Maps the error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::NoHardwareIdentity => ErrorClass::ConfigurationFatal,
            CoreError::IllegalTransition { .. } => ErrorClass::PermanentRejection,
            CoreError::Validation(_) => ErrorClass::PermanentRejection,
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too short.
    #[error("{field} must be at least {min} characters")]
    TooShort { field: String, min: usize },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (control characters, bad id alphabet).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
