//! # Identity & Registration Manager
//!
//! Owns the device identity and drives it to PROVISIONED.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Registration State Machine                          │
//! │                                                                         │
//! │  UNIDENTIFIED ──derive id from hardware──► IDENTIFIED                  │
//! │                                                │ persist (no network)   │
//! │                                                ▼                        │
//! │                                         REGISTERED_LOCAL                │
//! │                                                │ register(device_id)    │
//! │                                                │ needs hub UP           │
//! │                                                ▼                        │
//! │                                         REGISTERED_REMOTE               │
//! │                                                │ provision(token)       │
//! │                                                │ needs hub UP           │
//! │                                                ▼                        │
//! │                                           PROVISIONED                   │
//! │                                                                         │
//! │  hub down          → Deferred (no backoff consumed)                    │
//! │  retryable failure → exponential backoff, 5s .. 5min                   │
//! │  rejection         → Halted, operator notified, no further attempts    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wake-ups
//! The driver loop re-evaluates on every connectivity change, on a
//! [`RegistrationManager::nudge`] from the delivery engine, and on a jittered
//! timer floor.
//!
//! The state only moves forward: the store refuses backward updates, and a
//! provisioned identity is never re-derived.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scanlink_core::validation::validate_device_id;
use scanlink_core::{
    derive_device_id, ConnectivitySnapshot, CoreError, DeviceIdentity, LayerState, RegistrationState,
};
use scanlink_db::Database;

use crate::config::AgentConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{AgentError, AgentResult};
use crate::hardware::HardwareSources;
use crate::hub::{HubClient, HubError, HubResult};
use crate::jittered;
use crate::operator::OperatorChannel;

/// Result of one registration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The identity moved to this state.
    Advanced(RegistrationState),
    /// Already provisioned; nothing to do.
    Provisioned,
    /// Hub not reachable; try again on the next connectivity change.
    Deferred,
    /// A transient failure is backing off for this long.
    Backoff(Duration),
    /// The registry rejected the device; no further attempts this run.
    Halted,
}

struct Progress {
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
    halted: Option<String>,
}

/// Drives the device identity through registration.
pub struct RegistrationManager {
    db: Database,
    hub: Arc<dyn HubClient>,
    connectivity: Arc<ConnectivityMonitor>,
    operator: Arc<dyn OperatorChannel>,
    hardware: HardwareSources,
    request_timeout: Duration,
    probe_interval: Duration,
    backoff_cap: Duration,
    timer_floor: Duration,
    identity_tx: watch::Sender<Option<DeviceIdentity>>,
    progress: Mutex<Progress>,
    nudge: Notify,
}

impl RegistrationManager {
    pub fn new(
        config: &AgentConfig,
        db: Database,
        hub: Arc<dyn HubClient>,
        connectivity: Arc<ConnectivityMonitor>,
        operator: Arc<dyn OperatorChannel>,
        hardware: HardwareSources,
    ) -> Self {
        let settings = &config.registration;
        let base = Duration::from_secs(settings.backoff_base_secs);
        let cap = Duration::from_secs(settings.backoff_cap_secs).max(base);

        let (identity_tx, _) = watch::channel(None);

        RegistrationManager {
            db,
            hub,
            connectivity,
            operator,
            hardware,
            request_timeout: config.request_timeout(),
            probe_interval: config.connectivity.probe_interval(),
            backoff_cap: cap,
            timer_floor: Duration::from_secs(settings.timer_floor_secs),
            identity_tx,
            progress: Mutex::new(Progress {
                backoff: create_backoff(base, cap),
                retry_at: None,
                halted: None,
            }),
            nudge: Notify::new(),
        }
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Current identity, once known.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity_tx.borrow().clone()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.identity_tx
            .borrow()
            .as_ref()
            .map_or(RegistrationState::Unidentified, |i| i.registration_state)
    }

    /// Subscribes to identity changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceIdentity>> {
        self.identity_tx.subscribe()
    }

    /// Fatal registration error for the status surface, if any.
    pub async fn registration_error(&self) -> Option<String> {
        if let Some(reason) = self.progress.lock().await.halted.clone() {
            return Some(reason);
        }
        self.identity_tx
            .borrow()
            .as_ref()
            .and_then(|i| i.fatal_error.clone())
    }

    /// Asks the driver to re-evaluate now.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    fn publish(&self, identity: DeviceIdentity) {
        self.identity_tx.send_replace(Some(identity));
    }

    // =========================================================================
    // Local Identity
    // =========================================================================

    /// Establishes the local identity: UNIDENTIFIED → IDENTIFIED →
    /// REGISTERED_LOCAL. No network involved.
    ///
    /// A stored identity that already holds a registry token or hub
    /// credential is used as is. Fails with a configuration error when no
    /// hardware attribute is available and nothing is stored.
    pub async fn ensure_identity(&self) -> AgentResult<DeviceIdentity> {
        if let Some(current) = self.identity() {
            if current.registration_state >= RegistrationState::RegisteredLocal {
                return Ok(current);
            }
        }

        let stored = self.db.identity().load().await?;
        if let Some(stored) = stored.as_ref().filter(|s| s.has_credential_material()) {
            debug!(device_id = %stored.device_id, state = %stored.registration_state, "Using stored identity");
            return self.adopt(stored.clone()).await;
        }

        let device_id = match derive_device_id(&self.hardware.read().await) {
            Ok(id) => id,
            Err(e) => match stored {
                Some(stored) => {
                    warn!(?e, device_id = %stored.device_id, "Hardware unreadable, keeping stored id");
                    return self.adopt(stored).await;
                }
                None => return Err(e.into()),
            },
        };
        validate_device_id(&device_id).map_err(CoreError::from)?;

        let now = Utc::now();
        self.publish(DeviceIdentity {
            device_id: device_id.clone(),
            registration_state: RegistrationState::Identified,
            registry_token: None,
            hub_credential: None,
            fatal_error: None,
            created_at: now,
            updated_at: now,
        });
        info!(%device_id, "Device identified");

        let local = self.db.identity().create_local(&device_id).await?;
        info!(device_id = %local.device_id, state = %local.registration_state, "Identity persisted");
        self.adopt(local).await
    }

    async fn adopt(&self, identity: DeviceIdentity) -> AgentResult<DeviceIdentity> {
        let stamped = self.db.events().backfill_device_id(&identity.device_id).await?;
        if stamped > 0 {
            info!(count = stamped, "Stamped device id on earlier events");
        }
        self.publish(identity.clone());
        Ok(identity)
    }

    // =========================================================================
    // Remote Registration
    // =========================================================================

    /// Attempts at most one transition.
    pub async fn step(&self) -> AgentResult<StepOutcome> {
        let identity = match self.identity() {
            Some(i) if i.registration_state >= RegistrationState::RegisteredLocal => i,
            _ => {
                let identity = self.ensure_identity().await?;
                return Ok(StepOutcome::Advanced(identity.registration_state));
            }
        };

        if identity.registration_state == RegistrationState::Provisioned {
            return Ok(StepOutcome::Provisioned);
        }

        {
            let progress = self.progress.lock().await;
            if progress.halted.is_some() {
                return Ok(StepOutcome::Halted);
            }
            if let Some(at) = progress.retry_at {
                let now = Instant::now();
                if now < at {
                    return Ok(StepOutcome::Backoff(at - now));
                }
            }
        }

        if !self.current_connectivity().await.hub_reachable() {
            debug!(state = %identity.registration_state, "Hub unreachable, registration deferred");
            return Ok(StepOutcome::Deferred);
        }

        match identity.registration_state {
            RegistrationState::RegisteredLocal => {
                match self.call(self.hub.register(&identity.device_id)).await {
                    Ok(token) => {
                        let updated = self.db.identity().record_registered(&token).await?;
                        self.advanced(updated).await
                    }
                    Err(e) => self.failed(&identity, e).await,
                }
            }
            RegistrationState::RegisteredRemote => {
                let token = identity.registry_token.clone().ok_or_else(|| {
                    AgentError::Internal("REGISTERED_REMOTE without registry token".into())
                })?;

                match self.call(self.hub.provision(&token)).await {
                    Ok(credential) => {
                        let updated = self.db.identity().record_provisioned(&credential).await?;
                        self.advanced(updated).await
                    }
                    Err(e) => self.failed(&identity, e).await,
                }
            }
            other => Ok(StepOutcome::Advanced(other)),
        }
    }

    /// Connectivity no older than one probe interval.
    ///
    /// Reuses the monitor's snapshot while it is that fresh and the hub layer
    /// has been observed; probes otherwise.
    async fn current_connectivity(&self) -> ConnectivitySnapshot {
        let snapshot = self.connectivity.snapshot();
        let age = (Utc::now() - snapshot.observed_at)
            .to_std()
            .unwrap_or(Duration::MAX);

        if snapshot.hub != LayerState::Unknown && age < self.probe_interval {
            return snapshot;
        }
        self.connectivity.probe_now().await
    }

    async fn call<T>(&self, fut: impl std::future::Future<Output = HubResult<T>>) -> HubResult<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .unwrap_or_else(|_| Err(HubError::timeout(self.request_timeout)))
    }

    async fn advanced(&self, identity: DeviceIdentity) -> AgentResult<StepOutcome> {
        {
            let mut progress = self.progress.lock().await;
            progress.backoff.reset();
            progress.retry_at = None;
        }

        info!(
            device_id = %identity.device_id,
            state = %identity.registration_state,
            "Registration advanced"
        );
        let state = identity.registration_state;
        self.publish(identity);
        Ok(StepOutcome::Advanced(state))
    }

    async fn failed(&self, identity: &DeviceIdentity, err: HubError) -> AgentResult<StepOutcome> {
        if !err.retryable {
            let reason = AgentError::RegistrationRejected(err.to_string()).to_string();
            error!(device_id = %identity.device_id, state = %identity.registration_state, %reason, "Registration halted");

            self.db.identity().record_fatal(&reason).await?;
            self.progress.lock().await.halted = Some(reason.clone());
            self.operator.registration_fatal(&identity.device_id, &reason);

            let mut updated = identity.clone();
            updated.fatal_error = Some(reason);
            self.publish(updated);
            return Ok(StepOutcome::Halted);
        }

        let mut progress = self.progress.lock().await;
        let delay = progress
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap);
        progress.retry_at = Some(Instant::now() + delay);

        warn!(
            state = %identity.registration_state,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "Registration attempt failed, backing off"
        );
        Ok(StepOutcome::Backoff(delay))
    }

    // =========================================================================
    // Driver Loop
    // =========================================================================

    /// Drives registration until provisioned, halted or cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Registration driver started");
        let mut connectivity = self.connectivity.subscribe();

        loop {
            let wait = match self.step().await {
                Ok(StepOutcome::Provisioned)
                | Ok(StepOutcome::Advanced(RegistrationState::Provisioned)) => {
                    info!("Device provisioned, registration driver done");
                    break;
                }
                Ok(StepOutcome::Halted) => break,
                Ok(StepOutcome::Advanced(_)) => continue,
                Ok(StepOutcome::Deferred) => jittered(self.timer_floor),
                Ok(StepOutcome::Backoff(delay)) => delay.min(jittered(self.timer_floor)),
                Err(e) => {
                    error!(?e, "Registration step failed");
                    jittered(self.timer_floor)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                Ok(()) = connectivity.changed() => {}
                _ = self.nudge.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Registration driver stopped");
    }
}

/// Registration backoff: doubling from `base`, ±25 % jitter, capped.
///
/// Jitter is bounded so consecutive intervals keep increasing until the cap.
fn create_backoff(base: Duration, cap: Duration) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: base,
        max_interval: cap,
        multiplier: 2.0,
        randomization_factor: 0.25,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivitySettings;
    use crate::hub::MockHubClient;
    use crate::operator::{MockOperatorChannel, NoOpOperatorChannel};
    use crate::probe::ManualProbe;
    use scanlink_db::DbConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        manager: RegistrationManager,
        hub_probe: ManualProbe,
        db: Database,
        _root: tempfile::TempDir,
    }

    async fn fixture(hub: MockHubClient, operator: Arc<dyn OperatorChannel>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(
            root.path().join("etc/machine-id"),
            "0123456789abcdef0123456789abcdef",
        )
        .unwrap();

        let hub_probe = ManualProbe::new(true);
        let connectivity = Arc::new(ConnectivityMonitor::new(
            &ConnectivitySettings {
                debounce_count: 1,
                ..Default::default()
            },
            Arc::new(ManualProbe::new(true)),
            Arc::new(ManualProbe::new(true)),
            Arc::new(hub_probe.clone()),
        ));

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let manager = RegistrationManager::new(
            &AgentConfig::default(),
            db.clone(),
            Arc::new(hub),
            connectivity,
            operator,
            HardwareSources::rooted_at(root.path()),
        );

        Fixture {
            manager,
            hub_probe,
            db,
            _root: root,
        }
    }

    #[tokio::test]
    async fn test_ensure_identity_is_local_and_idempotent() {
        let fx = fixture(MockHubClient::new(), Arc::new(NoOpOperatorChannel)).await;

        let first = fx.manager.ensure_identity().await.unwrap();
        assert_eq!(first.registration_state, RegistrationState::RegisteredLocal);
        assert!(first.device_id.starts_with("dev-"));

        let second = fx.manager.ensure_identity().await.unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(fx.manager.registration_state(), RegistrationState::RegisteredLocal);
    }

    #[tokio::test]
    async fn test_identity_backfills_earlier_events() {
        let fx = fixture(MockHubClient::new(), Arc::new(NoOpOperatorChannel)).await;
        let event = fx.db.events().append("4006381333931").await.unwrap();
        assert!(event.device_id.is_none());

        let identity = fx.manager.ensure_identity().await.unwrap();
        let stored = fx.db.events().get(event.id).await.unwrap().unwrap();
        assert_eq!(stored.device_id, Some(identity.device_id));
    }

    /// Lets a pending backoff elapse without waiting for it.
    async fn skip_backoff(manager: &RegistrationManager) {
        manager.progress.lock().await.retry_at = None;
    }

    #[tokio::test]
    async fn test_retryable_failures_back_off_then_provision() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut hub = MockHubClient::new();
        hub.expect_register().times(4).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(HubError::network("connection reset"))
            } else {
                Ok("reg-token".to_string())
            }
        });
        hub.expect_provision()
            .withf(|token: &str| token == "reg-token")
            .times(1)
            .returning(|_| Ok("hub-cred".to_string()));

        let fx = fixture(hub, Arc::new(NoOpOperatorChannel)).await;
        fx.manager.ensure_identity().await.unwrap();

        let mut delays = Vec::new();
        loop {
            match fx.manager.step().await.unwrap() {
                StepOutcome::Backoff(delay) => {
                    delays.push(delay);
                    skip_backoff(&fx.manager).await;
                }
                StepOutcome::Advanced(RegistrationState::Provisioned) => break,
                StepOutcome::Advanced(_) => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(delays.len(), 3);
        assert!(delays[0] < delays[1], "{:?}", delays);
        assert!(delays[1] < delays[2], "{:?}", delays);

        let stored = fx.db.identity().load().await.unwrap().unwrap();
        assert_eq!(stored.registration_state, RegistrationState::Provisioned);
        assert_eq!(stored.provisioned_credential(), Some("hub-cred"));
    }

    #[tokio::test]
    async fn test_backoff_is_honored_between_attempts() {
        let mut hub = MockHubClient::new();
        hub.expect_register()
            .times(1)
            .returning(|_| Err(HubError::network("refused")));

        let fx = fixture(hub, Arc::new(NoOpOperatorChannel)).await;
        fx.manager.ensure_identity().await.unwrap();

        let StepOutcome::Backoff(first) = fx.manager.step().await.unwrap() else {
            panic!("expected backoff");
        };

        // Still waiting: no second register call
        let StepOutcome::Backoff(remaining) = fx.manager.step().await.unwrap() else {
            panic!("expected backoff");
        };
        assert!(remaining <= first);
    }

    #[tokio::test]
    async fn test_rejection_halts_and_notifies_operator() {
        let mut hub = MockHubClient::new();
        hub.expect_register()
            .times(1)
            .returning(|_| Err(HubError::rejected("HTTP 409: duplicate device id")));

        let mut operator = MockOperatorChannel::new();
        operator
            .expect_registration_fatal()
            .withf(|_, reason: &str| reason.contains("duplicate"))
            .times(1)
            .return_const(());

        let fx = fixture(hub, Arc::new(operator)).await;
        fx.manager.ensure_identity().await.unwrap();

        assert_eq!(fx.manager.step().await.unwrap(), StepOutcome::Halted);
        assert_eq!(fx.manager.step().await.unwrap(), StepOutcome::Halted);

        assert!(fx.manager.registration_error().await.is_some());
        let stored = fx.db.identity().load().await.unwrap().unwrap();
        assert_eq!(stored.registration_state, RegistrationState::RegisteredLocal);
        assert!(stored.fatal_error.is_some());
    }

    #[tokio::test]
    async fn test_hub_down_defers_without_calling() {
        let mut hub = MockHubClient::new();
        hub.expect_register().times(0);

        let fx = fixture(hub, Arc::new(NoOpOperatorChannel)).await;
        fx.hub_probe.set(false);
        fx.manager.ensure_identity().await.unwrap();

        assert_eq!(fx.manager.step().await.unwrap(), StepOutcome::Deferred);
        assert_eq!(fx.manager.registration_state(), RegistrationState::RegisteredLocal);
    }

    #[tokio::test]
    async fn test_provisioned_survives_connectivity_flaps() {
        let mut hub = MockHubClient::new();
        hub.expect_register()
            .times(1)
            .returning(|_| Ok("reg-token".to_string()));
        hub.expect_provision()
            .times(1)
            .returning(|_| Ok("hub-cred".to_string()));

        let fx = fixture(hub, Arc::new(NoOpOperatorChannel)).await;
        fx.manager.ensure_identity().await.unwrap();
        fx.manager.step().await.unwrap();
        fx.manager.step().await.unwrap();
        assert_eq!(fx.manager.registration_state(), RegistrationState::Provisioned);

        for reachable in [false, true, false, false, true] {
            fx.hub_probe.set(reachable);
            fx.manager.connectivity.probe_now().await;
            assert_eq!(fx.manager.step().await.unwrap(), StepOutcome::Provisioned);
        }

        // Re-running the local setup keeps the provisioned identity
        let again = fx.manager.ensure_identity().await.unwrap();
        assert_eq!(again.registration_state, RegistrationState::Provisioned);
    }

    #[tokio::test]
    async fn test_recent_snapshot_is_reused_instead_of_probing() {
        let mut hub = MockHubClient::new();
        hub.expect_register()
            .times(1)
            .returning(|_| Ok("reg-token".to_string()));

        let fx = fixture(hub, Arc::new(NoOpOperatorChannel)).await;
        fx.manager.ensure_identity().await.unwrap();
        fx.manager.connectivity.probe_now().await;

        // A probe now would see the hub down; the snapshot from a moment ago
        // still counts
        fx.hub_probe.set(false);
        assert_eq!(
            fx.manager.step().await.unwrap(),
            StepOutcome::Advanced(RegistrationState::RegisteredRemote)
        );
        assert!(fx.manager.connectivity.snapshot().hub_reachable());
    }

    #[tokio::test]
    async fn test_unobserved_hub_is_probed_before_registering() {
        let mut hub = MockHubClient::new();
        hub.expect_register()
            .times(1)
            .returning(|_| Ok("reg-token".to_string()));

        let fx = fixture(hub, Arc::new(NoOpOperatorChannel)).await;
        fx.manager.ensure_identity().await.unwrap();
        assert!(!fx.manager.connectivity.snapshot().hub_reachable());

        assert_eq!(
            fx.manager.step().await.unwrap(),
            StepOutcome::Advanced(RegistrationState::RegisteredRemote)
        );
        assert!(fx.manager.connectivity.snapshot().hub_reachable());
    }
}
