//! # Device Identity Derivation
//!
//! Turns stable hardware attributes into a device id.
//!
//! ## Derivation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Device Id Derivation                                 │
//! │                                                                         │
//! │  HardwareFingerprint (read by the agent)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Pick the most stable attribute present:                               │
//! │       1. CPU serial   (/proc/cpuinfo "Serial", not all zeros)          │
//! │       2. MAC address  (first non-loopback NIC, normalised)             │
//! │       3. machine-id   (/etc/machine-id)                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  UUID v5 over "cpu:<serial>" / "mac:<addr>" / "machine:<id>"           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  "dev-" + first 12 hex chars                                           │
//! │                                                                         │
//! │  None present? → CoreError::NoHardwareIdentity (never random)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the highest-priority attribute feeds the hash, so plugging in a USB
//! network adapter later does not change the id of a board with a CPU serial.

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Namespace for device id UUIDs.
const DEVICE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5c, 0x3a, 0x91, 0x0e, 0x7b, 0x42, 0x4d, 0x1f, 0x9a, 0x6e, 0x20, 0x8b, 0xd4, 0x17, 0xc3, 0x55,
]);

/// Prefix of every derived device id.
pub const DEVICE_ID_PREFIX: &str = "dev-";

/// Number of hex characters after the prefix.
const DEVICE_ID_HEX_LEN: usize = 12;

/// Stable hardware attributes, as read from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareFingerprint {
    pub cpu_serial: Option<String>,
    pub mac_address: Option<String>,
    pub machine_id: Option<String>,
}

impl HardwareFingerprint {
    /// Canonical name of the most stable attribute present.
    pub fn canonical(&self) -> Option<String> {
        if let Some(serial) = self.cpu_serial.as_deref().and_then(normalize_serial) {
            return Some(format!("cpu:{}", serial));
        }

        if let Some(mac) = self.mac_address.as_deref().and_then(normalize_mac) {
            return Some(format!("mac:{}", mac));
        }

        self.machine_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| format!("machine:{}", id.to_ascii_lowercase()))
    }

    pub fn is_empty(&self) -> bool {
        self.canonical().is_none()
    }
}

/// Derives the device id from hardware attributes.
///
/// Same fingerprint in, same id out.
pub fn derive_device_id(fingerprint: &HardwareFingerprint) -> CoreResult<String> {
    let canonical = fingerprint
        .canonical()
        .ok_or(CoreError::NoHardwareIdentity)?;

    let uuid = Uuid::new_v5(&DEVICE_NAMESPACE, canonical.as_bytes());
    let hex = uuid.simple().to_string();

    Ok(format!("{}{}", DEVICE_ID_PREFIX, &hex[..DEVICE_ID_HEX_LEN]))
}

fn normalize_serial(serial: &str) -> Option<String> {
    let serial = serial.trim().to_ascii_lowercase();
    if serial.is_empty() || serial.chars().all(|c| c == '0') {
        return None;
    }
    Some(serial)
}

/// Lowercase hex with separators stripped. Rejects all-zero and malformed MACs.
fn normalize_mac(mac: &str) -> Option<String> {
    let hex: String = mac
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if hex.chars().all(|c| c == '0') {
        return None;
    }
    Some(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_device_id;

    fn with_mac(mac: &str) -> HardwareFingerprint {
        HardwareFingerprint {
            mac_address: Some(mac.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let fp = HardwareFingerprint {
            cpu_serial: Some("10000000a3b2c1d0".to_string()),
            mac_address: Some("dc:a6:32:01:02:03".to_string()),
            machine_id: Some("4f1c2a".to_string()),
        };

        let first = derive_device_id(&fp).unwrap();
        let second = derive_device_id(&fp).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(DEVICE_ID_PREFIX));
        assert_eq!(first.len(), DEVICE_ID_PREFIX.len() + DEVICE_ID_HEX_LEN);
        assert!(validate_device_id(&first).is_ok());
    }

    #[test]
    fn test_cpu_serial_wins_over_mac() {
        let serial_only = HardwareFingerprint {
            cpu_serial: Some("10000000a3b2c1d0".to_string()),
            ..Default::default()
        };
        let serial_and_mac = HardwareFingerprint {
            mac_address: Some("dc:a6:32:01:02:03".to_string()),
            ..serial_only.clone()
        };

        assert_eq!(
            derive_device_id(&serial_only).unwrap(),
            derive_device_id(&serial_and_mac).unwrap()
        );
    }

    #[test]
    fn test_zero_serial_falls_back_to_mac() {
        let fp = HardwareFingerprint {
            cpu_serial: Some("0000000000000000".to_string()),
            mac_address: Some("DC-A6-32-01-02-03".to_string()),
            machine_id: None,
        };
        assert_eq!(fp.canonical().as_deref(), Some("mac:dca632010203"));
    }

    #[test]
    fn test_mac_formatting_is_normalised() {
        assert_eq!(
            derive_device_id(&with_mac("dc:a6:32:01:02:03")).unwrap(),
            derive_device_id(&with_mac("DC-A6-32-01-02-03")).unwrap()
        );
    }

    #[test]
    fn test_zero_mac_is_ignored() {
        assert!(with_mac("00:00:00:00:00:00").is_empty());
        assert!(with_mac("not-a-mac").is_empty());
    }

    #[test]
    fn test_no_attributes_is_fatal() {
        let err = derive_device_id(&HardwareFingerprint::default()).unwrap_err();
        assert!(matches!(err, CoreError::NoHardwareIdentity));
        assert_eq!(err.class(), crate::ErrorClass::ConfigurationFatal);
    }

    #[test]
    fn test_machine_id_fallback() {
        let fp = HardwareFingerprint {
            machine_id: Some("  A1B2C3D4E5F6\n".to_string()),
            ..Default::default()
        };
        assert_eq!(fp.canonical().as_deref(), Some("machine:a1b2c3d4e5f6"));
    }
}
