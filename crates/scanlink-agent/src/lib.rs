//! # scanlink-agent: Store-and-Forward Edge Agent
//!
//! Runs on the scanner board. Every scan is written to the event store
//! first; background workers then get it to the hub and to any locally
//! attached consumers.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Edge Agent Architecture                          │
//! │                                                                         │
//! │  capture (stdin, wedge scanner)                                        │
//! │        │ AgentHandle::append                                            │
//! │        ▼                                                                │
//! │  ┌──────────────────┐   wake   ┌──────────────────┐                    │
//! │  │   Event Store    │─────────►│  DeliveryEngine  │──► hub /events     │
//! │  │  (scanlink-db)   │          └────────┬─────────┘                    │
//! │  │                  │   wake   ┌────────┴─────────┐                    │
//! │  │                  │─────────►│  OutputForwarder │──► HID / serial /  │
//! │  └──────────────────┘          └──────────────────┘    network / file  │
//! │                                         ▲                               │
//! │  ┌──────────────────┐  snapshot ┌───────┴──────────┐                   │
//! │  │ Connectivity     │──────────►│ Registration     │──► hub /devices   │
//! │  │ Monitor          │  (watch)  │ Manager          │                   │
//! │  │ local/inet/hub   │           │ identity (watch) │                   │
//! │  └──────────────────┘           └──────────────────┘                   │
//! │                                                                         │
//! │  All workers share one CancellationToken owned by the AgentHandle.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`]: builder, startup recovery, handle and shutdown
//! - [`config`]: layered TOML/env configuration
//! - [`connectivity`] / [`probe`]: debounced three-layer reachability
//! - [`registration`] / [`hardware`]: device identity state machine
//! - [`delivery`] / [`hub`]: hub upload loop and HTTP collaborator
//! - [`forwarder`] / [`channels`]: local output fan-out
//! - [`operator`]: operator-visible alerts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scanlink_agent::{AgentBuilder, AgentConfig};
//!
//! let config = AgentConfig::load(None)?;
//! let handle = AgentBuilder::new(config).build().await?.start().await?;
//!
//! let receipt = handle.capture("4006381333931").await;
//! let status = handle.status().await?;
//!
//! handle.shutdown(Duration::from_secs(10)).await;
//! ```

use rand::Rng;
use std::time::Duration;

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod channels;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod error;
pub mod forwarder;
pub mod hardware;
pub mod hub;
pub mod operator;
pub mod probe;
pub mod registration;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{Agent, AgentBuilder, AgentHandle, CaptureReceipt, ProbeSet};
pub use channels::OutputChannel;
pub use config::{AgentConfig, ChannelConfig};
pub use connectivity::ConnectivityMonitor;
pub use delivery::{CycleOutcome, CycleReport, DeliveryEngine};
pub use error::{AgentError, AgentResult};
pub use forwarder::{ForwardReport, OutputForwarder};
pub use hardware::HardwareSources;
pub use hub::{DeliveryRequest, HttpHubClient, HubClient, HubError, HubErrorKind, HubResult};
pub use operator::{LogOperatorChannel, NoOpOperatorChannel, OperatorChannel};
pub use probe::{GatewayProbe, HubProbe, ManualProbe, Probe, ProbeFailure, TcpProbe};
pub use registration::{RegistrationManager, StepOutcome};

/// Stretches a timer by up to 10 % so a fleet restarting together does not
/// probe or retry in lockstep.
pub(crate) fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=0.1);
    base + base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d <= base.mul_f64(1.1));
        }
    }

    #[test]
    fn test_zero_stays_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
