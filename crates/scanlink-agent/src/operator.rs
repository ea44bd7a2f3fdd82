//! # Operator Channel
//!
//! Where conditions that need a human go: permanently rejected events, a
//! registry refusing the device, and a store close to its ceiling. Ordinary
//! transient backoff never reaches this channel.

use tracing::{error, warn};

use scanlink_core::ScanEvent;

/// Receives operator-visible conditions.
///
/// Implementations must return quickly; they are called from worker loops.
#[cfg_attr(test, mockall::automock)]
pub trait OperatorChannel: Send + Sync {
    /// The hub rejected an event for good.
    fn permanent_failure(&self, event: &ScanEvent, reason: &str);

    /// The registry refused the device; registration has stopped.
    fn registration_fatal(&self, device_id: &str, reason: &str);

    /// Outstanding events crossed the pressure threshold.
    fn store_pressure(&self, outstanding: u64, capacity: u64);
}

/// Writes operator conditions to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOperatorChannel;

impl OperatorChannel for LogOperatorChannel {
    fn permanent_failure(&self, event: &ScanEvent, reason: &str) {
        error!(
            event_id = event.id,
            payload = %event.payload,
            attempts = event.attempt_count,
            %reason,
            "Scan event permanently rejected by hub"
        );
    }

    fn registration_fatal(&self, device_id: &str, reason: &str) {
        error!(%device_id, %reason, "Device registration rejected; operator action required");
    }

    fn store_pressure(&self, outstanding: u64, capacity: u64) {
        warn!(outstanding, capacity, "Event store nearing capacity");
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpOperatorChannel;

impl OperatorChannel for NoOpOperatorChannel {
    fn permanent_failure(&self, _event: &ScanEvent, _reason: &str) {}
    fn registration_fatal(&self, _device_id: &str, _reason: &str) {}
    fn store_pressure(&self, _outstanding: u64, _capacity: u64) {}
}
