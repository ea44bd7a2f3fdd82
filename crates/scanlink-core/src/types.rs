//! # Domain Types
//!
//! Core domain types used throughout the edge agent.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────────┐  │
//! │  │    ScanEvent     │  │  DeviceIdentity  │  │ ConnectivitySnapshot │  │
//! │  │  ──────────────  │  │  ──────────────  │  │  ──────────────────  │  │
//! │  │  id (i64, seq)   │  │  device_id       │  │  local_segment       │  │
//! │  │  payload         │  │  registration_   │  │  internet            │  │
//! │  │  captured_at     │  │    state         │  │  hub                 │  │
//! │  │  delivery_state  │  │  registry_token  │  │  observed_at         │  │
//! │  │  attempt_count   │  │  hub_credential  │  │                      │  │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────────┘  │
//! │                                                                         │
//! │  DeliveryState:                                                        │
//! │    PENDING ──► IN_FLIGHT ──┬──► DELIVERED                              │
//! │       ▲                    ├──► FAILED_PERMANENT                       │
//! │       └────── retry ───────┘                                           │
//! │                                                                         │
//! │  RegistrationState (monotonic):                                        │
//! │    UNIDENTIFIED ► IDENTIFIED ► REGISTERED_LOCAL ►                      │
//! │                         REGISTERED_REMOTE ► PROVISIONED                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Delivery State
// =============================================================================

/// Where a scan event is in its delivery lifecycle.
///
/// `InFlight` is advisory: any row left in it by a crash is reset to
/// `Pending` at startup, which makes delivery at-least-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    /// Waiting for delivery (possibly backing off).
    #[default]
    Pending,
    /// A delivery attempt is running.
    InFlight,
    /// Acknowledged by the hub.
    Delivered,
    /// Rejected by the hub; kept for audit, never retried.
    FailedPermanent,
}

impl DeliveryState {
    /// Returns true for states no further delivery attempt can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::FailedPermanent)
    }

    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::InFlight => "IN_FLIGHT",
            DeliveryState::Delivered => "DELIVERED",
            DeliveryState::FailedPermanent => "FAILED_PERMANENT",
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Scan Event
// =============================================================================

/// One decoded scan and its delivery bookkeeping.
///
/// `id`, `payload` and `captured_at` never change after append. Only the
/// delivery engine touches the remaining fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    /// Local sequence number, strictly increasing.
    pub id: i64,

    /// Opaque identifier string as decoded by the scanner.
    pub payload: String,

    /// When the scan was appended.
    pub captured_at: DateTime<Utc>,

    /// Device id, once one has been derived.
    pub device_id: Option<String>,

    pub delivery_state: DeliveryState,

    /// Number of delivery attempts started.
    pub attempt_count: u32,

    pub last_attempt_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Earliest time the event is eligible for another attempt.
    pub next_attempt_at: DateTime<Utc>,
}

impl ScanEvent {
    /// Returns true if the event is pending and its backoff has elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.delivery_state == DeliveryState::Pending && self.next_attempt_at <= now
    }
}

// =============================================================================
// Registration State
// =============================================================================

/// Registration progress of this device. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    /// No device id yet.
    Unidentified,
    /// Device id derived from hardware.
    Identified,
    /// Identity persisted locally.
    RegisteredLocal,
    /// Registry accepted the device id and issued a registry token.
    RegisteredRemote,
    /// Hub credential issued; delivery may proceed.
    Provisioned,
}

impl RegistrationState {
    /// The state that follows this one, if any.
    pub fn next(&self) -> Option<RegistrationState> {
        match self {
            RegistrationState::Unidentified => Some(RegistrationState::Identified),
            RegistrationState::Identified => Some(RegistrationState::RegisteredLocal),
            RegistrationState::RegisteredLocal => Some(RegistrationState::RegisteredRemote),
            RegistrationState::RegisteredRemote => Some(RegistrationState::Provisioned),
            RegistrationState::Provisioned => None,
        }
    }

    /// Returns true if the next transition needs the hub.
    pub fn needs_network(&self) -> bool {
        matches!(
            self,
            RegistrationState::RegisteredLocal | RegistrationState::RegisteredRemote
        )
    }

    /// Checks that moving to `to` does not go backwards.
    ///
    /// Staying in the same state is allowed (idempotent writes).
    pub fn check_transition(&self, to: RegistrationState) -> CoreResult<()> {
        if to < *self {
            return Err(CoreError::IllegalTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Unidentified => "UNIDENTIFIED",
            RegistrationState::Identified => "IDENTIFIED",
            RegistrationState::RegisteredLocal => "REGISTERED_LOCAL",
            RegistrationState::RegisteredRemote => "REGISTERED_REMOTE",
            RegistrationState::Provisioned => "PROVISIONED",
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Device Identity
// =============================================================================

/// Persisted identity and registration material of this device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub registration_state: RegistrationState,

    /// Issued by the registry in exchange for the device id.
    pub registry_token: Option<String>,

    /// Issued by the hub in exchange for the registry token.
    pub hub_credential: Option<String>,

    /// Set when the registry permanently rejected this device.
    pub fatal_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Returns true if server-side state already references this device id.
    ///
    /// While this holds the device id must not be regenerated.
    pub fn has_credential_material(&self) -> bool {
        self.registry_token.is_some() || self.hub_credential.is_some()
    }

    /// Returns the hub credential if the device is provisioned.
    pub fn provisioned_credential(&self) -> Option<&str> {
        match self.registration_state {
            RegistrationState::Provisioned => self.hub_credential.as_deref(),
            _ => None,
        }
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("registration_state", &self.registration_state)
            .field("registry_token", &self.registry_token.as_ref().map(|_| "<redacted>"))
            .field("hub_credential", &self.hub_credential.as_ref().map(|_| "<redacted>"))
            .field("fatal_error", &self.fatal_error)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// =============================================================================
// Connectivity
// =============================================================================

/// Debounced state of one connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerState {
    /// Not enough consistent probe results yet.
    #[default]
    Unknown,
    Up,
    Down,
}

impl LayerState {
    pub fn is_up(&self) -> bool {
        matches!(self, LayerState::Up)
    }
}

impl std::fmt::Display for LayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerState::Unknown => write!(f, "UNKNOWN"),
            LayerState::Up => write!(f, "UP"),
            LayerState::Down => write!(f, "DOWN"),
        }
    }
}

/// The three connectivity layers probed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    LocalSegment,
    Internet,
    Hub,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::LocalSegment, Layer::Internet, Layer::Hub];
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::LocalSegment => write!(f, "local_segment"),
            Layer::Internet => write!(f, "internet"),
            Layer::Hub => write!(f, "hub"),
        }
    }
}

/// Point-in-time view of connectivity. Replaced wholesale, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    pub local_segment: LayerState,
    pub internet: LayerState,
    pub hub: LayerState,
    pub observed_at: DateTime<Utc>,
}

impl ConnectivitySnapshot {
    /// Builds a snapshot, capping the hub layer by the internet layer.
    ///
    /// The hub can only be reported `Up` when the internet is `Up`; otherwise
    /// the hub takes the internet layer's state.
    pub fn new(
        local_segment: LayerState,
        internet: LayerState,
        hub: LayerState,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let hub = match (internet, hub) {
            (LayerState::Up, hub) => hub,
            (internet, LayerState::Up) => internet,
            (_, hub) => hub,
        };

        ConnectivitySnapshot {
            local_segment,
            internet,
            hub,
            observed_at,
        }
    }

    /// Snapshot before any probe has completed.
    pub fn unknown(observed_at: DateTime<Utc>) -> Self {
        ConnectivitySnapshot::new(
            LayerState::Unknown,
            LayerState::Unknown,
            LayerState::Unknown,
            observed_at,
        )
    }

    pub fn local_segment_reachable(&self) -> bool {
        self.local_segment.is_up()
    }

    pub fn internet_reachable(&self) -> bool {
        self.internet.is_up()
    }

    pub fn hub_reachable(&self) -> bool {
        self.hub.is_up() && self.internet.is_up()
    }

    pub fn layer(&self, layer: Layer) -> LayerState {
        match layer {
            Layer::LocalSegment => self.local_segment,
            Layer::Internet => self.internet,
            Layer::Hub => self.hub,
        }
    }
}

// =============================================================================
// Agent Status
// =============================================================================

/// Read-only status for dashboards and CLIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub registration_state: RegistrationState,
    pub connectivity: ConnectivitySnapshot,

    /// Events in PENDING or IN_FLIGHT.
    pub pending_count: u64,

    /// Age of the oldest undelivered event.
    pub oldest_pending_age: Option<Duration>,

    /// Events the hub rejected permanently.
    pub failed_permanent_count: u64,

    /// Fatal registration or configuration error, if any.
    pub registration_error: Option<String>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_order() {
        let mut state = RegistrationState::Unidentified;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(next > state);
            state = next;
            seen.push(state);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(state, RegistrationState::Provisioned);
    }

    #[test]
    fn test_registration_never_moves_backwards() {
        let provisioned = RegistrationState::Provisioned;
        assert!(provisioned.check_transition(RegistrationState::Provisioned).is_ok());
        assert!(provisioned
            .check_transition(RegistrationState::RegisteredLocal)
            .is_err());
        assert!(RegistrationState::Identified
            .check_transition(RegistrationState::RegisteredLocal)
            .is_ok());
    }

    #[test]
    fn test_only_remote_steps_need_network() {
        assert!(!RegistrationState::Identified.needs_network());
        assert!(RegistrationState::RegisteredLocal.needs_network());
        assert!(RegistrationState::RegisteredRemote.needs_network());
        assert!(!RegistrationState::Provisioned.needs_network());
    }

    #[test]
    fn test_hub_capped_by_internet() {
        let now = Utc::now();

        let snap = ConnectivitySnapshot::new(LayerState::Up, LayerState::Down, LayerState::Up, now);
        assert_eq!(snap.hub, LayerState::Down);
        assert!(!snap.hub_reachable());

        let snap = ConnectivitySnapshot::new(
            LayerState::Up,
            LayerState::Unknown,
            LayerState::Up,
            now,
        );
        assert_eq!(snap.hub, LayerState::Unknown);

        let snap = ConnectivitySnapshot::new(LayerState::Down, LayerState::Up, LayerState::Up, now);
        assert!(snap.hub_reachable());
        assert!(!snap.local_segment_reachable());
    }

    #[test]
    fn test_event_eligibility() {
        let now = Utc::now();
        let mut event = ScanEvent {
            id: 1,
            payload: "4006381333931".to_string(),
            captured_at: now,
            device_id: None,
            delivery_state: DeliveryState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            next_attempt_at: now,
        };
        assert!(event.is_eligible(now));

        event.next_attempt_at = now + chrono::Duration::seconds(10);
        assert!(!event.is_eligible(now));

        event.next_attempt_at = now;
        event.delivery_state = DeliveryState::FailedPermanent;
        assert!(!event.is_eligible(now));
        assert!(event.delivery_state.is_terminal());
    }

    #[test]
    fn test_identity_debug_redacts_secrets() {
        let now = Utc::now();
        let identity = DeviceIdentity {
            device_id: "dev-0123456789ab".to_string(),
            registration_state: RegistrationState::Provisioned,
            registry_token: Some("reg-secret".to_string()),
            hub_credential: Some("hub-secret".to_string()),
            fatal_error: None,
            created_at: now,
            updated_at: now,
        };

        let debug = format!("{:?}", identity);
        assert!(!debug.contains("reg-secret"));
        assert!(!debug.contains("hub-secret"));
        assert_eq!(identity.provisioned_credential(), Some("hub-secret"));
        assert!(identity.has_credential_material());
    }
}
