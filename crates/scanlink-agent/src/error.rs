//! # Agent Error Types
//!
//! Error types for the edge agent workers.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Agent Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Collaborator  │  │     Local               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Hub(HubError)  │  │  Store(DbError)         │ │
//! │  │  MissingSetting │  │  Registration-  │  │  Core(CoreError)        │ │
//! │  │  InvalidUrl     │  │    Rejected     │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Every variant maps onto one ErrorClass:                               │
//! │  TransientNetwork │ TransientLocal │ PermanentRejection │               │
//! │  ConfigurationFatal                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use scanlink_core::{CoreError, ErrorClass};
use scanlink_db::DbError;
use thiserror::Error;

use crate::hub::HubError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent error type covering every failure a worker or the supervisor can
/// report.
#[derive(Debug, Error)]
pub enum AgentError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid agent configuration.
    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    /// A setting the agent cannot run without.
    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),

    /// Invalid hub URL.
    #[error("Invalid hub URL: {0}")]
    InvalidUrl(String),

    /// Failed to read or parse the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Domain / Storage Errors
    // =========================================================================
    /// Domain rule violated (identity derivation, illegal transition).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Event store or identity store failure.
    #[error(transparent)]
    Store(#[from] DbError),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Registry or hub call failed.
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    /// The registry refused the device for good.
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Agent is shutting down.
    #[error("Agent is shutting down")]
    ShuttingDown,

    /// Internal agent error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        AgentError::ConfigLoadFailed(err.to_string())
    }
}

impl From<url::ParseError> for AgentError {
    fn from(err: url::ParseError) -> Self {
        AgentError::InvalidUrl(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl AgentError {
    /// Maps the error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::InvalidConfig(_)
            | AgentError::MissingSetting(_)
            | AgentError::InvalidUrl(_)
            | AgentError::ConfigLoadFailed(_) => ErrorClass::ConfigurationFatal,

            AgentError::Core(e) => e.class(),
            AgentError::Store(e) => e.class(),
            AgentError::Hub(e) => e.class(),

            AgentError::RegistrationRejected(_) => ErrorClass::PermanentRejection,

            AgentError::ShuttingDown | AgentError::Internal(_) => ErrorClass::TransientLocal,
        }
    }

    /// Returns true if the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Returns true if this error means the agent must not start.
    pub fn is_config_error(&self) -> bool {
        self.class() == ErrorClass::ConfigurationFatal
    }

    /// Returns true if the append was refused because the store is at its
    /// ceiling.
    pub fn is_store_full(&self) -> bool {
        matches!(self, AgentError::Store(DbError::StoreFull { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubErrorKind;

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(AgentError::MissingSetting("hub.url").is_config_error());
        assert!(AgentError::InvalidUrl("nope".into()).is_config_error());
        assert!(!AgentError::MissingSetting("hub.api_key").is_retryable());
    }

    #[test]
    fn test_store_full_is_transient_local() {
        let err: AgentError = DbError::StoreFull {
            outstanding: 5,
            capacity: 5,
        }
        .into();

        assert!(err.is_store_full());
        assert_eq!(err.class(), ErrorClass::TransientLocal);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_hub_error_class_follows_retryable_flag() {
        let transient: AgentError = HubError::new(HubErrorKind::Server, "503", true).into();
        assert_eq!(transient.class(), ErrorClass::TransientNetwork);

        let rejected: AgentError = HubError::new(HubErrorKind::Rejected, "422", false).into();
        assert_eq!(rejected.class(), ErrorClass::PermanentRejection);
    }

    #[test]
    fn test_no_hardware_identity_is_fatal() {
        let err: AgentError = CoreError::NoHardwareIdentity.into();
        assert!(err.is_config_error());
    }
}
