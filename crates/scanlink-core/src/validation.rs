//! # Validation Module
//!
//! Input rules checked before anything touches the event store or the hub.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Capture collaborator                                         │
//! │  └── Line framing, symbology decoding (out of process)                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Payload: non-empty, bounded, printable                            │
//! │  └── Device id: prefix alphabet and length                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  └── NOT NULL / CHECK constraints                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Beyond these rules the payload is opaque: symbology checks belong to the
//! hub, which answers with a permanent rejection.

use crate::error::ValidationError;
use crate::MAX_PAYLOAD_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a scan payload and returns it trimmed.
///
/// ## Rules
/// - Must not be empty after trimming
/// - At most [`MAX_PAYLOAD_LEN`] characters
/// - No control characters (scanners terminate with CR/LF, which is trimmed)
///
/// ## Example
/// ```rust
/// use scanlink_core::validation::validate_payload;
///
/// assert_eq!(validate_payload(" 4006381333931\r\n").unwrap(), "4006381333931");
/// assert!(validate_payload("   ").is_err());
/// ```
pub fn validate_payload(payload: &str) -> ValidationResult<&str> {
    let payload = payload.trim();

    if payload.is_empty() {
        return Err(ValidationError::Required {
            field: "payload".to_string(),
        });
    }

    if payload.chars().count() > MAX_PAYLOAD_LEN {
        return Err(ValidationError::TooLong {
            field: "payload".to_string(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    if payload.chars().any(char::is_control) {
        return Err(ValidationError::InvalidFormat {
            field: "payload".to_string(),
            reason: "contains control characters".to_string(),
        });
    }

    Ok(payload)
}

/// Validates a device id.
///
/// ## Rules
/// - At least 8 characters
/// - Letters, digits, hyphens and underscores only
pub fn validate_device_id(device_id: &str) -> ValidationResult<()> {
    if device_id.is_empty() {
        return Err(ValidationError::Required {
            field: "device_id".to_string(),
        });
    }

    if device_id.len() < 8 {
        return Err(ValidationError::TooShort {
            field: "device_id".to_string(),
            min: 8,
        });
    }

    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "device_id".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_trimmed() {
        assert_eq!(validate_payload("  817994ccfe14 \n").unwrap(), "817994ccfe14");
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            validate_payload("\r\n"),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_long_payload_rejected() {
        let long = "9".repeat(MAX_PAYLOAD_LEN + 1);
        assert!(matches!(
            validate_payload(&long),
            Err(ValidationError::TooLong { .. })
        ));
        assert!(validate_payload(&"9".repeat(MAX_PAYLOAD_LEN)).is_ok());
    }

    #[test]
    fn test_embedded_control_rejected() {
        assert!(validate_payload("12\u{1b}34").is_err());
        assert!(validate_payload("12\t34").is_err());
    }

    #[test]
    fn test_payload_otherwise_opaque() {
        assert!(validate_payload("BAD").is_ok());
        assert!(validate_payload("]C1010012345678901215").is_ok());
    }

    #[test]
    fn test_device_id_rules() {
        assert!(validate_device_id("dev-0123456789ab").is_ok());
        assert!(validate_device_id("dev-1").is_err());
        assert!(validate_device_id("dev 0123456789").is_err());
        assert!(validate_device_id("").is_err());
    }
}
