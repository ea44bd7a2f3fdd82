//! # Delivery Engine
//!
//! Uploads pending scan events to the hub and records each outcome in the
//! event store.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Delivery Cycle                                    │
//! │                                                                         │
//! │  identity PROVISIONED?  ── no ──► nudge registration, leave PENDING    │
//! │         │ yes                                                           │
//! │  hub reachable?         ── no ──► leave PENDING                        │
//! │         │ yes                                                           │
//! │         ▼                                                               │
//! │  list_eligible(now, batch)   id order, backing-off rows skipped        │
//! │         │                                                               │
//! │         ▼  for each event                                               │
//! │  mark_in_flight ──► deliver(credential, event)                         │
//! │                        │                                                │
//! │        ┌───────────────┼────────────────────┐                          │
//! │        ▼               ▼                    ▼                          │
//! │    ack             retryable            rejected                       │
//! │  mark_delivered   mark_retry(+backoff)   mark_permanent_failure         │
//! │                   (transport error:      + operator notified            │
//! │                    stop this cycle)                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wake-ups
//! New events (via [`DeliveryEngine::waker`]), connectivity changes,
//! identity changes, the earliest retry time, and a jittered timer floor.
//!
//! A failed or backing-off event never holds up later ones: eligibility is
//! decided per row by the store query.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scanlink_core::{RetryPolicy, ScanEvent};
use scanlink_db::Database;

use crate::config::AgentConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::AgentResult;
use crate::hub::{DeliveryRequest, HubClient, HubError, HubResult};
use crate::jittered;
use crate::operator::OperatorChannel;
use crate::registration::RegistrationManager;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Event ids attempted, in attempt order.
    pub attempted: Vec<i64>,
    pub delivered: usize,
    pub retried: usize,
    pub failed_permanent: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Identity not provisioned yet; registration was nudged.
    NotProvisioned,
    /// Hub layer not up.
    HubUnreachable,
    Ran(CycleReport),
}

enum Attempt {
    Delivered,
    Retry,
    Failed,
    /// Retry scheduled, and the failure says the hub is unreachable.
    Transport,
}

/// Store-and-forward upload loop.
pub struct DeliveryEngine {
    db: Database,
    hub: Arc<dyn HubClient>,
    connectivity: Arc<ConnectivityMonitor>,
    registration: Arc<RegistrationManager>,
    operator: Arc<dyn OperatorChannel>,
    policy: RetryPolicy,
    batch_size: u32,
    request_timeout: Duration,
    timer_floor: Duration,
    wake: Arc<Notify>,
}

impl DeliveryEngine {
    pub fn new(
        config: &AgentConfig,
        db: Database,
        hub: Arc<dyn HubClient>,
        connectivity: Arc<ConnectivityMonitor>,
        registration: Arc<RegistrationManager>,
        operator: Arc<dyn OperatorChannel>,
    ) -> Self {
        let settings = &config.delivery;

        DeliveryEngine {
            db,
            hub,
            connectivity,
            registration,
            operator,
            policy: RetryPolicy::new(
                Duration::from_secs(settings.retry_base_secs),
                Duration::from_secs(settings.retry_cap_secs),
            ),
            batch_size: settings.batch_size,
            request_timeout: config.request_timeout(),
            timer_floor: Duration::from_secs(settings.timer_floor_secs),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle used to wake the engine when events are appended.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Runs one delivery cycle.
    pub async fn run_cycle(&self) -> AgentResult<CycleOutcome> {
        self.cycle(&CancellationToken::new()).await
    }

    async fn cycle(&self, cancel: &CancellationToken) -> AgentResult<CycleOutcome> {
        let identity = self.registration.identity();
        let Some((device_id, credential)) = identity.as_ref().and_then(|i| {
            i.provisioned_credential()
                .map(|c| (i.device_id.clone(), c.to_string()))
        }) else {
            debug!("Identity not provisioned, delivery parked");
            self.registration.nudge();
            return Ok(CycleOutcome::NotProvisioned);
        };

        if !self.connectivity.snapshot().hub_reachable() {
            debug!("Hub unreachable, delivery parked");
            return Ok(CycleOutcome::HubUnreachable);
        }

        let events = self
            .db
            .events()
            .list_eligible(Utc::now(), self.batch_size)
            .await?;
        let full_batch = events.len() as u32 >= self.batch_size;

        let mut report = CycleReport::default();
        for event in events {
            // In-flight calls finish; nothing new starts after cancellation
            if cancel.is_cancelled() {
                return Ok(CycleOutcome::Ran(report));
            }

            report.attempted.push(event.id);
            match self.attempt(&event, &device_id, &credential).await? {
                Attempt::Delivered => report.delivered += 1,
                Attempt::Retry => report.retried += 1,
                Attempt::Failed => report.failed_permanent += 1,
                Attempt::Transport => {
                    report.retried += 1;
                    debug!(event_id = event.id, "Transport failure, ending cycle early");
                    return Ok(CycleOutcome::Ran(report));
                }
            }
        }

        if full_batch {
            self.wake.notify_one();
        }

        if !report.attempted.is_empty() {
            info!(
                attempted = report.attempted.len(),
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed_permanent,
                "Delivery cycle complete"
            );
        }
        Ok(CycleOutcome::Ran(report))
    }

    async fn attempt(
        &self,
        event: &ScanEvent,
        device_id: &str,
        credential: &str,
    ) -> AgentResult<Attempt> {
        let events = self.db.events();
        let attempts = events.mark_in_flight(event.id, Utc::now()).await?;

        // Always the identity being delivered under, never the id stamped at
        // capture: an unprovisioned id may have been replaced since.
        let request = DeliveryRequest {
            device_id: device_id.to_string(),
            event_id: event.id,
            payload: event.payload.clone(),
            captured_at: event.captured_at,
        };

        let result = tokio::time::timeout(self.request_timeout, self.hub.deliver(credential, &request))
            .await
            .unwrap_or_else(|_| Err(HubError::timeout(self.request_timeout)));

        match self.record(event, attempts, result).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Outcome lost; hand the event back rather than strand it IN_FLIGHT
                match events.release_in_flight(event.id).await {
                    Ok(true) => debug!(event_id = event.id, "Event returned to PENDING"),
                    Ok(false) => {}
                    Err(release) => warn!(
                        event_id = event.id,
                        ?release,
                        "Could not return event to PENDING"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn record(
        &self,
        event: &ScanEvent,
        attempts: u32,
        result: HubResult<()>,
    ) -> AgentResult<Attempt> {
        let events = self.db.events();

        match result {
            Ok(()) => {
                events.mark_delivered(event.id).await?;
                debug!(event_id = event.id, attempts, "Event delivered");
                Ok(Attempt::Delivered)
            }
            Err(e) if e.retryable => {
                let delay = self.policy.delay(attempts, rand::random::<f64>());
                let next = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                events.mark_retry(event.id, &e.to_string(), next).await?;

                warn!(
                    event_id = event.id,
                    attempts,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Delivery failed, will retry"
                );
                Ok(if e.is_transport() {
                    Attempt::Transport
                } else {
                    Attempt::Retry
                })
            }
            Err(e) => {
                let reason = e.to_string();
                events.mark_permanent_failure(event.id, &reason).await?;
                self.operator.permanent_failure(event, &reason);
                Ok(Attempt::Failed)
            }
        }
    }

    /// Time until the next event leaves backoff, capped by the timer floor.
    async fn next_wait(&self) -> Duration {
        let floor = jittered(self.timer_floor);
        let now = Utc::now();

        match self.db.events().next_retry_at(now).await {
            Ok(Some(at)) => (at - now).to_std().unwrap_or_default().min(floor),
            Ok(None) => floor,
            Err(e) => {
                warn!(?e, "Could not read next retry time");
                floor
            }
        }
    }

    /// Runs delivery cycles until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(batch_size = self.batch_size, "Delivery engine started");
        let mut connectivity = self.connectivity.subscribe();
        let mut identity = self.registration.subscribe();

        loop {
            if let Err(e) = self.cycle(&cancel).await {
                error!(?e, "Delivery cycle failed");
            }

            let wait = self.next_wait().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                Ok(()) = connectivity.changed() => {}
                Ok(()) = identity.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Delivery engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivitySettings;
    use crate::hardware::HardwareSources;
    use crate::hub::MockHubClient;
    use crate::operator::{MockOperatorChannel, NoOpOperatorChannel};
    use crate::probe::ManualProbe;
    use scanlink_core::DeliveryState;
    use scanlink_db::DbConfig;
    use std::sync::Mutex;

    struct Fixture {
        engine: DeliveryEngine,
        hub_probe: ManualProbe,
        db: Database,
    }

    async fn provisioned_db() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let identity = db.identity();
        identity.create_local("dev-0123456789ab").await.unwrap();
        identity.record_registered("reg-token").await.unwrap();
        identity.record_provisioned("hub-cred").await.unwrap();
        db
    }

    async fn fixture(db: Database, hub: MockHubClient, operator: Arc<dyn OperatorChannel>) -> Fixture {
        fixture_with_hardware(db, hub, operator, HardwareSources::rooted_at("/nonexistent")).await
    }

    async fn fixture_with_hardware(
        db: Database,
        hub: MockHubClient,
        operator: Arc<dyn OperatorChannel>,
        hardware: HardwareSources,
    ) -> Fixture {
        let hub: Arc<dyn HubClient> = Arc::new(hub);
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
        connectivity.probe_now().await;

        let config = AgentConfig::default();
        let registration = Arc::new(RegistrationManager::new(
            &config,
            db.clone(),
            hub.clone(),
            connectivity.clone(),
            Arc::new(NoOpOperatorChannel),
            hardware,
        ));
        // Without readable hardware this only adopts a stored identity
        let _ = registration.ensure_identity().await;

        let engine = DeliveryEngine::new(&config, db.clone(), hub, connectivity, registration, operator);
        Fixture {
            engine,
            hub_probe,
            db,
        }
    }

    fn recording_hub(seen: Arc<Mutex<Vec<(i64, String)>>>) -> MockHubClient {
        let mut hub = MockHubClient::new();
        hub.expect_deliver().returning(move |credential, request| {
            assert_eq!(credential, "hub-cred");
            seen.lock()
                .unwrap()
                .push((request.event_id, request.payload.clone()));
            if request.payload == "BAD" {
                Err(HubError::rejected("HTTP 422: malformed barcode"))
            } else {
                Ok(())
            }
        });
        hub
    }

    async fn state_of(db: &Database, id: i64) -> DeliveryState {
        db.events().get(id).await.unwrap().unwrap().delivery_state
    }

    #[tokio::test]
    async fn test_queued_while_down_then_delivered_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fx = fixture(provisioned_db().await, recording_hub(seen.clone()), Arc::new(NoOpOperatorChannel)).await;

        fx.hub_probe.set(false);
        fx.engine.connectivity.probe_now().await;

        let mut ids = Vec::new();
        for payload in ["4006381333931", "5012345678900", "9780201379624"] {
            ids.push(fx.db.events().append(payload).await.unwrap().id);
        }

        assert_eq!(fx.engine.run_cycle().await.unwrap(), CycleOutcome::HubUnreachable);
        for id in &ids {
            assert_eq!(state_of(&fx.db, *id).await, DeliveryState::Pending);
        }
        assert!(seen.lock().unwrap().is_empty());

        fx.hub_probe.set(true);
        fx.engine.connectivity.probe_now().await;

        let CycleOutcome::Ran(report) = fx.engine.run_cycle().await.unwrap() else {
            panic!("expected a cycle");
        };
        assert_eq!(report.attempted, ids);
        assert_eq!(report.delivered, 3);

        let order: Vec<i64> = seen.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, ids);
        for id in &ids {
            assert_eq!(state_of(&fx.db, *id).await, DeliveryState::Delivered);
        }
    }

    #[tokio::test]
    async fn test_rejected_payload_never_retried() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut operator = MockOperatorChannel::new();
        operator
            .expect_permanent_failure()
            .withf(|event: &ScanEvent, _| event.payload == "BAD")
            .times(1)
            .return_const(());

        let fx = fixture(provisioned_db().await, recording_hub(seen.clone()), Arc::new(operator)).await;
        let bad = fx.db.events().append("BAD").await.unwrap().id;
        let good = fx.db.events().append("4006381333931").await.unwrap().id;

        fx.engine.run_cycle().await.unwrap();
        assert_eq!(state_of(&fx.db, bad).await, DeliveryState::FailedPermanent);
        assert_eq!(state_of(&fx.db, good).await, DeliveryState::Delivered);

        for _ in 0..5 {
            fx.engine.run_cycle().await.unwrap();
        }

        let bad_calls = seen.lock().unwrap().iter().filter(|(id, _)| *id == bad).count();
        assert_eq!(bad_calls, 1);

        let stored = fx.db.events().get(bad).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_backing_off_event_does_not_block_later_events() {
        let mut hub = MockHubClient::new();
        hub.expect_deliver().returning(|_, request| {
            if request.payload == "FLAKY" {
                Err(HubError::from_status(
                    reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    "",
                    true,
                ))
            } else {
                Ok(())
            }
        });

        let fx = fixture(provisioned_db().await, hub, Arc::new(NoOpOperatorChannel)).await;
        let flaky = fx.db.events().append("FLAKY").await.unwrap().id;
        let first = fx.db.events().append("4006381333931").await.unwrap().id;

        let CycleOutcome::Ran(report) = fx.engine.run_cycle().await.unwrap() else {
            panic!("expected a cycle");
        };
        assert_eq!(report.attempted, vec![flaky, first]);
        assert_eq!(report.retried, 1);
        assert_eq!(state_of(&fx.db, flaky).await, DeliveryState::Pending);

        // The flaky event is backing off; a new one goes straight through
        let second = fx.db.events().append("5012345678900").await.unwrap().id;
        let CycleOutcome::Ran(report) = fx.engine.run_cycle().await.unwrap() else {
            panic!("expected a cycle");
        };
        assert_eq!(report.attempted, vec![second]);

        let stored = fx.db.events().get(flaky).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.next_attempt_at > Utc::now());
    }

    #[tokio::test]
    async fn test_transport_failure_ends_cycle() {
        let mut hub = MockHubClient::new();
        hub.expect_deliver()
            .times(1)
            .returning(|_, _| Err(HubError::network("connection refused")));

        let fx = fixture(provisioned_db().await, hub, Arc::new(NoOpOperatorChannel)).await;
        let first = fx.db.events().append("4006381333931").await.unwrap().id;
        let second = fx.db.events().append("5012345678900").await.unwrap().id;

        fx.engine.run_cycle().await.unwrap();

        let untouched = fx.db.events().get(second).await.unwrap().unwrap();
        assert_eq!(untouched.attempt_count, 0);
        assert_eq!(untouched.delivery_state, DeliveryState::Pending);
        assert_eq!(state_of(&fx.db, first).await, DeliveryState::Pending);
    }

    #[tokio::test]
    async fn test_not_provisioned_parks_events() {
        let mut hub = MockHubClient::new();
        hub.expect_deliver().times(0);

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fx = fixture(db, hub, Arc::new(NoOpOperatorChannel)).await;
        let id = fx.db.events().append("4006381333931").await.unwrap().id;

        assert_eq!(fx.engine.run_cycle().await.unwrap(), CycleOutcome::NotProvisioned);
        assert_eq!(state_of(&fx.db, id).await, DeliveryState::Pending);
    }

    #[tokio::test]
    async fn test_events_go_out_under_the_replacement_device_id() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.identity().create_local("dev-aaaaaaaaaaaa").await.unwrap();
        let queued = db.events().append("4006381333931").await.unwrap();
        assert_eq!(queued.device_id.as_deref(), Some("dev-aaaaaaaaaaaa"));

        // Hardware now derives a different id; nothing was registered yet
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(
            root.path().join("etc/machine-id"),
            "77b4ae0b7c2877b4ae0b7c2877b4ae0b",
        )
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let mut hub = MockHubClient::new();
        hub.expect_register()
            .times(1)
            .returning(|device_id| Ok(format!("reg-{}", device_id)));
        hub.expect_provision()
            .times(1)
            .returning(|_| Ok("hub-cred".to_string()));
        hub.expect_deliver().returning(move |_, request| {
            recorded.lock().unwrap().push(request.device_id.clone());
            Ok(())
        });

        let fx = fixture_with_hardware(
            db,
            hub,
            Arc::new(NoOpOperatorChannel),
            HardwareSources::rooted_at(root.path()),
        )
        .await;

        let registration = &fx.engine.registration;
        let device_id = registration.identity().unwrap().device_id;
        assert_ne!(device_id, "dev-aaaaaaaaaaaa");

        registration.step().await.unwrap();
        assert_eq!(
            registration.step().await.unwrap(),
            crate::registration::StepOutcome::Advanced(scanlink_core::RegistrationState::Provisioned)
        );

        let stored = fx.db.events().get(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.device_id.as_deref(), Some(device_id.as_str()));

        fx.engine.run_cycle().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![device_id]);
        assert_eq!(state_of(&fx.db, queued.id).await, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_returns_event_to_pending() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fx = fixture(provisioned_db().await, recording_hub(seen.clone()), Arc::new(NoOpOperatorChannel)).await;
        let id = fx.db.events().append("4006381333931").await.unwrap().id;

        // The store refuses to record the acknowledgement
        sqlx::query(
            "CREATE TRIGGER refuse_delivered BEFORE UPDATE OF delivery_state ON scan_events \
             WHEN NEW.delivery_state = 'DELIVERED' \
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(fx.db.pool())
        .await
        .unwrap();

        assert!(fx.engine.run_cycle().await.is_err());
        let stored = fx.db.events().get(id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, DeliveryState::Pending);
        assert_eq!(stored.attempt_count, 1);

        sqlx::query("DROP TRIGGER refuse_delivered")
            .execute(fx.db.pool())
            .await
            .unwrap();

        fx.engine.run_cycle().await.unwrap();
        assert_eq!(state_of(&fx.db, id).await, DeliveryState::Delivered);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
