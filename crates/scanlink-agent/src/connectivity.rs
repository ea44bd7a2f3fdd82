//! # Connectivity Monitor
//!
//! Probes three layers on independent timers and publishes a debounced
//! snapshot.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Connectivity Monitor                              │
//! │                                                                         │
//! │   local loop ──┐      internet loop ──┐      hub loop ──┐              │
//! │   (1s timeout) │      (3s timeout)    │      (5s timeout)│              │
//! │                ▼                      ▼                  ▼              │
//! │           LayerTracker           LayerTracker       LayerTracker        │
//! │           (N in a row)           (N in a row)       (N in a row)        │
//! │                └──────────────┬───────┴──────────────────┘              │
//! │                               ▼                                         │
//! │              watch::Sender<ConnectivitySnapshot>                       │
//! │                               │ notifies only on a state change         │
//! │            ┌──────────────────┼──────────────────┐                     │
//! │            ▼                  ▼                  ▼                     │
//! │     Registration         Delivery            AgentHandle               │
//! │       Manager             Engine              status()                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A slow hub probe never delays the other two layers: each layer has its
//! own task, its own timeout and its own tracker. Subscribers only read;
//! nothing calls back into the monitor from a notification.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use scanlink_core::{ConnectivitySnapshot, Layer, LayerState, LayerTracker};

use crate::config::ConnectivitySettings;
use crate::jittered;
use crate::probe::{Probe, ProbeFailure};

struct LayerProbe {
    layer: Layer,
    probe: Arc<dyn Probe>,
    timeout: Duration,
    tracker: Mutex<LayerTracker>,
}

/// Debounced three-layer connectivity monitor.
pub struct ConnectivityMonitor {
    layers: [LayerProbe; 3],
    interval: Duration,
    tx: watch::Sender<ConnectivitySnapshot>,
}

impl ConnectivityMonitor {
    /// Creates a monitor in the all-`Unknown` state.
    pub fn new(
        settings: &ConnectivitySettings,
        local: Arc<dyn Probe>,
        internet: Arc<dyn Probe>,
        hub: Arc<dyn Probe>,
    ) -> Self {
        let layer = |layer, probe, timeout_ms| LayerProbe {
            layer,
            probe,
            timeout: Duration::from_millis(timeout_ms),
            tracker: Mutex::new(LayerTracker::new(settings.debounce_count)),
        };

        let (tx, _) = watch::channel(ConnectivitySnapshot::unknown(Utc::now()));

        ConnectivityMonitor {
            layers: [
                layer(Layer::LocalSegment, local, settings.local_timeout_ms),
                layer(Layer::Internet, internet, settings.internet_timeout_ms),
                layer(Layer::Hub, hub, settings.hub_timeout_ms),
            ],
            interval: settings.probe_interval(),
            tx,
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        *self.tx.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.tx.subscribe()
    }

    /// Probes every layer now, concurrently, and returns the resulting
    /// snapshot.
    ///
    /// Results go through the same debounce as scheduled probes, so a
    /// single contrary result does not flip a layer.
    pub async fn probe_now(&self) -> ConnectivitySnapshot {
        let [local, internet, hub] = &self.layers;
        tokio::join!(
            self.probe_layer(local),
            self.probe_layer(internet),
            self.probe_layer(hub)
        );
        self.snapshot()
    }

    async fn probe_layer(&self, layer: &LayerProbe) -> LayerState {
        let result = match tokio::time::timeout(layer.timeout, layer.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeFailure::Timeout),
        };

        if let Err(failure) = &result {
            debug!(
                layer = %layer.layer,
                probe = %layer.probe.describe(),
                failure = %failure,
                "Probe failed"
            );
        }

        let (changed, state) = {
            let mut tracker = layer.tracker.lock().await;
            (tracker.observe(result.is_ok()), tracker.state())
        };

        if let Some(new_state) = changed {
            info!(layer = %layer.layer, state = %new_state, "Connectivity changed");
        }
        self.publish().await;
        state
    }

    /// Rebuilds the snapshot from the trackers; subscribers are woken only
    /// when a visible layer state differs.
    async fn publish(&self) {
        let mut states = [LayerState::Unknown; 3];
        for (slot, layer) in states.iter_mut().zip(&self.layers) {
            *slot = layer.tracker.lock().await.state();
        }

        let next = ConnectivitySnapshot::new(states[0], states[1], states[2], Utc::now());
        self.tx.send_if_modified(|snapshot| {
            let changed = next.local_segment != snapshot.local_segment
                || next.internet != snapshot.internet
                || next.hub != snapshot.hub;
            *snapshot = next;
            changed
        });
    }

    /// Runs one probe loop per layer until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Connectivity monitor started");

        let [local, internet, hub] = &self.layers;
        tokio::join!(
            self.layer_loop(local, &cancel),
            self.layer_loop(internet, &cancel),
            self.layer_loop(hub, &cancel)
        );

        info!("Connectivity monitor stopped");
    }

    async fn layer_loop(&self, layer: &LayerProbe, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.probe_layer(layer) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(self.interval)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ManualProbe;

    fn settings(debounce: u32) -> ConnectivitySettings {
        ConnectivitySettings {
            debounce_count: debounce,
            ..Default::default()
        }
    }

    fn monitor(debounce: u32) -> (ConnectivityMonitor, ManualProbe, ManualProbe, ManualProbe) {
        let local = ManualProbe::new(true);
        let internet = ManualProbe::new(true);
        let hub = ManualProbe::new(true);
        let monitor = ConnectivityMonitor::new(
            &settings(debounce),
            Arc::new(local.clone()),
            Arc::new(internet.clone()),
            Arc::new(hub.clone()),
        );
        (monitor, local, internet, hub)
    }

    #[tokio::test]
    async fn test_debounce_before_up() {
        let (monitor, _, _, _) = monitor(2);
        assert_eq!(monitor.snapshot().hub, LayerState::Unknown);

        monitor.probe_now().await;
        assert_eq!(monitor.snapshot().hub, LayerState::Unknown);

        let snapshot = monitor.probe_now().await;
        assert!(snapshot.local_segment_reachable());
        assert!(snapshot.internet_reachable());
        assert!(snapshot.hub_reachable());
    }

    #[tokio::test]
    async fn test_single_failure_does_not_flap() {
        let (monitor, _, _, hub) = monitor(2);
        monitor.probe_now().await;
        monitor.probe_now().await;

        hub.set(false);
        assert!(monitor.probe_now().await.hub_reachable());

        hub.set(true);
        assert!(monitor.probe_now().await.hub_reachable());

        hub.set(false);
        monitor.probe_now().await;
        assert!(!monitor.probe_now().await.hub_reachable());
    }

    #[tokio::test]
    async fn test_hub_capped_by_internet() {
        let (monitor, _, internet, _) = monitor(1);
        internet.set(false);

        let snapshot = monitor.probe_now().await;
        assert_eq!(snapshot.internet, LayerState::Down);
        assert!(!snapshot.hub_reachable());
        assert_ne!(snapshot.hub, LayerState::Up);
    }

    #[tokio::test]
    async fn test_subscribers_notified_on_change_only() {
        let (monitor, _, _, hub) = monitor(1);
        let mut rx = monitor.subscribe();

        monitor.probe_now().await;
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        monitor.probe_now().await;
        assert!(!rx.has_changed().unwrap());

        hub.set(false);
        monitor.probe_now().await;
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().hub_reachable());
    }

    struct HangingProbe;

    #[async_trait::async_trait]
    impl Probe for HangingProbe {
        async fn probe(&self) -> crate::probe::ProbeResult {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "hang".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_hub_does_not_block_local() {
        let monitor = Arc::new(ConnectivityMonitor::new(
            &settings(1),
            Arc::new(ManualProbe::new(true)),
            Arc::new(ManualProbe::new(true)),
            Arc::new(HangingProbe),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.clone().run(cancel.clone()));

        let mut rx = monitor.subscribe();
        rx.wait_for(|s| s.local_segment_reachable()).await.unwrap();
        assert_eq!(monitor.snapshot().hub, LayerState::Unknown);

        // Hub times out and is marked down on its own schedule
        rx.wait_for(|s| s.hub == LayerState::Down).await.unwrap();
        assert!(monitor.snapshot().local_segment_reachable());

        cancel.cancel();
        task.await.unwrap();
    }
}
