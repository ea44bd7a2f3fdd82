//! # Output Forwarder
//!
//! Best-effort fan-out of new scan values to locally attached consumers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Forwarder Loop                                    │
//! │                                                                         │
//! │  wake (append) ──► list_after(cursor) ──► forward(event)               │
//! │                                              │                          │
//! │              ┌──────────────┬────────────────┼──────────────┐          │
//! │              ▼              ▼                ▼              ▼          │
//! │           usb_hid        serial          network        file ...       │
//! │        (available channels only, in parallel, each under a timeout)   │
//! │                                                                         │
//! │  every availability_interval: re-probe all channels                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The forwarder only reads the event store. A failed channel is logged and
//! nothing else; it never touches the event's delivery state.

use futures_util::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scanlink_core::ScanEvent;
use scanlink_db::Database;

use crate::channels::OutputChannel;
use crate::config::ForwarderSettings;
use crate::error::AgentResult;
use crate::jittered;

const FORWARD_BATCH: u32 = 100;

/// Per-event forwarding result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Channels that took the value.
    pub sent: Vec<String>,
    /// Channels that were tried and failed or timed out.
    pub failed: Vec<String>,
    /// Channels skipped as unavailable.
    pub skipped: usize,
}

pub struct OutputForwarder {
    db: Database,
    channels: Vec<OutputChannel>,
    availability: RwLock<Vec<bool>>,
    cursor: AtomicI64,
    send_timeout: Duration,
    availability_interval: Duration,
}

impl OutputForwarder {
    pub fn new(settings: &ForwarderSettings, db: Database, channels: Vec<OutputChannel>) -> Self {
        let count = channels.len();
        OutputForwarder {
            db,
            channels,
            availability: RwLock::new(vec![false; count]),
            cursor: AtomicI64::new(0),
            send_timeout: Duration::from_millis(settings.send_timeout_ms),
            availability_interval: Duration::from_secs(settings.availability_interval_secs),
        }
    }

    /// Builds the configured channel list. Network channels share one client.
    pub fn from_settings(settings: &ForwarderSettings, db: Database, client: &reqwest::Client) -> Self {
        let channels = settings
            .channels
            .iter()
            .map(|c| OutputChannel::from_config(c, client))
            .collect();
        Self::new(settings, db, channels)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(OutputChannel::name).collect()
    }

    /// Starts forwarding after the newest stored event, so a restart does not
    /// replay history onto attached devices.
    pub async fn prime_cursor(&self) -> AgentResult<i64> {
        let max_id = self.db.events().max_id().await?;
        self.cursor.store(max_id, Ordering::SeqCst);
        Ok(max_id)
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Probes every channel, each under the send timeout.
    pub async fn refresh_availability(&self) -> Vec<bool> {
        let probes = self.channels.iter().map(|channel| async move {
            tokio::time::timeout(self.send_timeout, channel.available())
                .await
                .unwrap_or(false)
        });
        let fresh = join_all(probes).await;

        let mut availability = self.availability.write().await;
        for (i, (was, now)) in availability.iter().zip(&fresh).enumerate() {
            if was != now {
                info!(channel = %self.channels[i].name(), available = now, "Output channel availability changed");
            }
        }
        *availability = fresh.clone();
        fresh
    }

    /// Sends one event to every available channel in parallel.
    pub async fn forward(&self, event: &ScanEvent) -> ForwardReport {
        let availability = self.availability.read().await.clone();

        let targets: Vec<&OutputChannel> = self
            .channels
            .iter()
            .zip(&availability)
            .filter_map(|(channel, &available)| available.then_some(channel))
            .collect();

        let mut report = ForwardReport {
            skipped: self.channels.len() - targets.len(),
            ..Default::default()
        };

        let sends = targets.iter().map(|channel| async move {
            let ok = tokio::time::timeout(self.send_timeout, channel.send(&event.payload))
                .await
                .unwrap_or(false);
            (channel.name(), ok)
        });

        for (name, ok) in join_all(sends).await {
            if ok {
                report.sent.push(name);
            } else {
                warn!(event_id = event.id, channel = %name, "Forwarding to output channel failed");
                report.failed.push(name);
            }
        }

        debug!(
            event_id = event.id,
            sent = report.sent.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "Event forwarded"
        );
        report
    }

    /// Forwards every event appended since the cursor, in id order.
    pub async fn forward_new(&self) -> AgentResult<usize> {
        let mut forwarded = 0;
        loop {
            let events = self
                .db
                .events()
                .list_after(self.cursor(), FORWARD_BATCH)
                .await?;
            let Some(last) = events.last().map(|e| e.id) else {
                return Ok(forwarded);
            };

            for event in &events {
                self.forward(event).await;
                forwarded += 1;
            }
            self.cursor.store(last, Ordering::SeqCst);
        }
    }

    /// Runs until cancelled. `wake` is notified on every append.
    pub async fn run(self: Arc<Self>, wake: Arc<Notify>, cancel: CancellationToken) {
        info!(channels = ?self.channel_names(), "Output forwarder started");
        self.refresh_availability().await;

        let mut refresh = tokio::time::interval(jittered(self.availability_interval).max(Duration::from_secs(1)));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick is immediate and availability was just probed
        refresh.tick().await;

        loop {
            if let Err(e) = self.forward_new().await {
                error!(?e, "Forwarding new events failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => {}
                _ = refresh.tick() => {
                    self.refresh_availability().await;
                }
            }
        }

        info!("Output forwarder stopped");
    }
}
