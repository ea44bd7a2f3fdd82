//! # scanlink-core: Pure Domain Logic for the ScanLink Edge Agent
//!
//! Everything the edge agent decides, without any of the I/O it performs.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ScanLink Edge Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Capture collaborator (scanner input)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ append(payload)                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   scanlink-agent: monitor, registration, delivery, forwarder    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ scanlink-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐  │   │
//! │  │   │  types   │ │  retry   │ │ debounce │ │ identity/validate│  │   │
//! │  │   │ ScanEvent│ │ backoff  │ │ UP/DOWN  │ │ dev-xxxxxxxxxxxx │  │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  scanlink-db (Event Store)                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (ScanEvent, DeviceIdentity, ConnectivitySnapshot)
//! - [`error`] - Domain errors and the failure taxonomy ([`ErrorClass`])
//! - [`retry`] - Per-event exponential backoff
//! - [`debounce`] - Per-layer connectivity debouncing
//! - [`identity`] - Deterministic device id derivation
//! - [`validation`] - Scan payload and device id rules
//!
//! ## Example Usage
//!
//! ```rust
//! use scanlink_core::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(300));
//!
//! // Third attempt failed: 2s * 2^2 = 8s before jitter
//! assert_eq!(policy.ceiling(3), Duration::from_secs(8));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod debounce;
pub mod error;
pub mod identity;
pub mod retry;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use debounce::LayerTracker;
pub use error::{CoreError, CoreResult, ErrorClass, ValidationError};
pub use identity::{derive_device_id, HardwareFingerprint};
pub use retry::RetryPolicy;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum accepted scan payload length, in characters.
///
/// Longest 2D symbologies the fleet scanners emit stay well under this.
pub const MAX_PAYLOAD_LEN: usize = 256;

/// Quantity attached to every scan when it reaches the hub.
///
/// The payload itself is opaque; quantity is a hub message convention.
pub const SCAN_QUANTITY: u32 = 1;

/// Outstanding share of store capacity at which operators are alerted.
pub const STORE_PRESSURE_RATIO: f64 = 0.9;
