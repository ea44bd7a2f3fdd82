//! # Agent Supervisor
//!
//! Wires the workers together, runs startup recovery and owns shutdown.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Agent Lifecycle                                 │
//! │                                                                         │
//! │  AgentBuilder::build()                                                 │
//! │    validate config ── open store ── hub client ── probes ── channels   │
//! │                                                                         │
//! │  Agent::start()                                                        │
//! │    1. reset IN_FLIGHT → PENDING (crash recovery)                       │
//! │    2. ensure local identity (no hardware id → refuse to start)         │
//! │    3. prime forwarder cursor                                           │
//! │    4. spawn workers under one CancellationToken:                       │
//! │                                                                         │
//! │       ┌──────────────┐ ┌──────────────┐ ┌──────────┐ ┌───────────┐    │
//! │       │ Connectivity │ │ Registration │ │ Delivery │ │ Forwarder │    │
//! │       │   Monitor    │ │   Driver     │ │  Engine  │ │           │    │
//! │       └──────────────┘ └──────────────┘ └──────────┘ └───────────┘    │
//! │                                                                         │
//! │  AgentHandle                                                           │
//! │    append / capture ──► event store ──► wake delivery + forwarder      │
//! │    status            ──► AgentStatus                                   │
//! │    shutdown(grace)   ──► cancel, join with deadline, abort stragglers  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scanlink_core::{AgentStatus, ConnectivitySnapshot, DeviceIdentity, ScanEvent, STORE_PRESSURE_RATIO};
use scanlink_db::{Database, DbConfig, DbError};

use crate::channels::OutputChannel;
use crate::config::AgentConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::delivery::DeliveryEngine;
use crate::error::{AgentError, AgentResult};
use crate::forwarder::OutputForwarder;
use crate::hardware::HardwareSources;
use crate::hub::{HttpHubClient, HubClient};
use crate::operator::{LogOperatorChannel, OperatorChannel};
use crate::probe::{GatewayProbe, HubProbe, Probe, TcpProbe};
use crate::registration::RegistrationManager;

// =============================================================================
// Capture Receipt
// =============================================================================

/// Answer to the capture collaborator for one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureReceipt {
    /// Store id, when accepted.
    pub id: Option<i64>,
    pub accepted: bool,
    /// Why the scan was not stored.
    pub rejection: Option<String>,
}

/// Local-segment, internet and hub probes, in that order.
pub struct ProbeSet {
    pub local: Arc<dyn Probe>,
    pub internet: Arc<dyn Probe>,
    pub hub: Arc<dyn Probe>,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an [`Agent`]. Anything not supplied is built from the config.
pub struct AgentBuilder {
    config: AgentConfig,
    db: Option<Database>,
    hub: Option<Arc<dyn HubClient>>,
    operator: Option<Arc<dyn OperatorChannel>>,
    probes: Option<ProbeSet>,
    hardware: HardwareSources,
    channels: Option<Vec<OutputChannel>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        AgentBuilder {
            config,
            db: None,
            hub: None,
            operator: None,
            probes: None,
            hardware: HardwareSources::default(),
            channels: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_hub(mut self, hub: Arc<dyn HubClient>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn OperatorChannel>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_probes(mut self, probes: ProbeSet) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn with_hardware(mut self, hardware: HardwareSources) -> Self {
        self.hardware = hardware;
        self
    }

    /// Replaces the configured output channels.
    pub fn with_channels(mut self, channels: Vec<OutputChannel>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Validates the config and constructs every component. Nothing runs yet.
    pub async fn build(self) -> AgentResult<Agent> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let db = match self.db {
            Some(db) => db,
            None => {
                let path = config.database_path();
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                info!(?path, capacity = config.storage.capacity, "Opening event store");
                Database::new(DbConfig::new(path).capacity(config.storage.capacity)).await?
            }
        };

        let hub: Arc<dyn HubClient> = match self.hub {
            Some(hub) => hub,
            None => Arc::new(HttpHubClient::new(
                config.hub_url(),
                config.api_key(),
                config.request_timeout(),
            )?),
        };

        let operator = self
            .operator
            .unwrap_or_else(|| Arc::new(LogOperatorChannel));

        let probes = self.probes.unwrap_or_else(|| ProbeSet {
            local: Arc::new(GatewayProbe::new(config.connectivity.local_target.clone())),
            internet: Arc::new(TcpProbe::new(config.connectivity.internet_targets.clone())),
            hub: Arc::new(HubProbe::new(hub.clone())),
        });

        let connectivity = Arc::new(ConnectivityMonitor::new(
            &config.connectivity,
            probes.local,
            probes.internet,
            probes.hub,
        ));

        let registration = Arc::new(RegistrationManager::new(
            &config,
            db.clone(),
            hub.clone(),
            connectivity.clone(),
            operator.clone(),
            self.hardware,
        ));

        let delivery = Arc::new(DeliveryEngine::new(
            &config,
            db.clone(),
            hub,
            connectivity.clone(),
            registration.clone(),
            operator.clone(),
        ));

        let forwarder = if config.forwarder.enabled {
            let forwarder = match self.channels {
                Some(channels) => OutputForwarder::new(&config.forwarder, db.clone(), channels),
                None => {
                    let client = reqwest::Client::builder()
                        .timeout(Duration::from_millis(config.forwarder.send_timeout_ms))
                        .build()
                        .map_err(|e| AgentError::Internal(format!("HTTP client: {}", e)))?;
                    OutputForwarder::from_settings(&config.forwarder, db.clone(), &client)
                }
            };
            Some(Arc::new(forwarder))
        } else {
            debug!("Output forwarder disabled");
            None
        };

        Ok(Agent {
            config,
            db,
            operator,
            connectivity,
            registration,
            delivery,
            forwarder,
        })
    }
}

// =============================================================================
// Agent
// =============================================================================

/// A fully wired agent that has not started its workers.
pub struct Agent {
    config: Arc<AgentConfig>,
    db: Database,
    operator: Arc<dyn OperatorChannel>,
    connectivity: Arc<ConnectivityMonitor>,
    registration: Arc<RegistrationManager>,
    delivery: Arc<DeliveryEngine>,
    forwarder: Option<Arc<OutputForwarder>>,
}

impl Agent {
    /// Runs startup recovery and spawns the workers.
    ///
    /// Fails with a configuration error when the device has no usable
    /// identity; the agent does not run half-configured.
    pub async fn start(self) -> AgentResult<AgentHandle> {
        let reset = self.db.events().reset_in_flight_on_startup().await?;
        if reset > 0 {
            warn!(count = reset, "Events were in flight at last shutdown, requeued");
        }

        let identity = match self.registration.ensure_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                error!(?e, "Cannot establish device identity, refusing to start");
                return Err(e);
            }
        };

        let forwarder_wake = Arc::new(Notify::new());
        if let Some(forwarder) = &self.forwarder {
            forwarder.prime_cursor().await?;
        }

        let cancel = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                "connectivity",
                tokio::spawn(self.connectivity.clone().run(cancel.child_token())),
            ),
            (
                "registration",
                tokio::spawn(self.registration.clone().run(cancel.child_token())),
            ),
            (
                "delivery",
                tokio::spawn(self.delivery.clone().run(cancel.child_token())),
            ),
        ];
        if let Some(forwarder) = &self.forwarder {
            tasks.push((
                "forwarder",
                tokio::spawn(
                    forwarder
                        .clone()
                        .run(forwarder_wake.clone(), cancel.child_token()),
                ),
            ));
        }

        info!(
            device_id = %identity.device_id,
            device_name = %self.config.device.name,
            state = %identity.registration_state,
            workers = tasks.len(),
            "Agent started"
        );

        Ok(AgentHandle {
            pressure_threshold: pressure_threshold(self.db.event_capacity()),
            delivery_wake: self.delivery.waker(),
            forwarder_wake: self.forwarder.as_ref().map(|_| forwarder_wake),
            config: self.config,
            db: self.db,
            operator: self.operator,
            connectivity: self.connectivity,
            registration: self.registration,
            pressure: AtomicBool::new(false),
            cancel,
            tasks,
        })
    }
}

fn pressure_threshold(capacity: u64) -> u64 {
    ((capacity as f64) * STORE_PRESSURE_RATIO).ceil() as u64
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running agent.
pub struct AgentHandle {
    config: Arc<AgentConfig>,
    db: Database,
    operator: Arc<dyn OperatorChannel>,
    connectivity: Arc<ConnectivityMonitor>,
    registration: Arc<RegistrationManager>,
    delivery_wake: Arc<Notify>,
    forwarder_wake: Option<Arc<Notify>>,
    pressure_threshold: u64,
    pressure: AtomicBool,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl AgentHandle {
    /// Durably stores one scan and wakes the workers.
    ///
    /// Returns only after the event is on disk. Validation and capacity
    /// failures come straight back to the caller.
    pub async fn append(&self, payload: &str) -> AgentResult<ScanEvent> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }

        let event = match self.db.events().append(payload).await {
            Ok(event) => event,
            Err(e) => {
                if let DbError::StoreFull {
                    outstanding,
                    capacity,
                } = &e
                {
                    self.raise_pressure(*outstanding, *capacity);
                }
                return Err(e.into());
            }
        };

        self.delivery_wake.notify_one();
        if let Some(wake) = &self.forwarder_wake {
            wake.notify_one();
        }

        self.check_pressure().await;
        Ok(event)
    }

    /// Capture entry point: like [`append`](Self::append) but never fails,
    /// reporting a refused scan in the receipt instead.
    pub async fn capture(&self, payload: &str) -> CaptureReceipt {
        match self.append(payload).await {
            Ok(event) => CaptureReceipt {
                id: Some(event.id),
                accepted: true,
                rejection: None,
            },
            Err(e) => {
                warn!(error = %e, class = %e.class(), "Scan not stored");
                CaptureReceipt {
                    id: None,
                    accepted: false,
                    rejection: Some(e.to_string()),
                }
            }
        }
    }

    async fn check_pressure(&self) {
        match self.db.events().count_outstanding().await {
            Ok(outstanding) if outstanding >= self.pressure_threshold => {
                self.raise_pressure(outstanding, self.db.event_capacity());
            }
            Ok(_) => {
                if self.pressure.swap(false, Ordering::SeqCst) {
                    info!("Event store pressure relieved");
                }
            }
            Err(e) => warn!(?e, "Could not count outstanding events"),
        }
    }

    /// Alerts once per crossing of the threshold.
    fn raise_pressure(&self, outstanding: u64, capacity: u64) {
        if !self.pressure.swap(true, Ordering::SeqCst) {
            self.operator.store_pressure(outstanding, capacity);
        }
    }

    /// Cuts every pending backoff short and wakes delivery.
    ///
    /// For an operator who knows the hub is back before the monitor does.
    /// Returns the number of events made eligible.
    pub async fn retry_all_now(&self) -> AgentResult<u64> {
        let forced = self.db.events().force_retry_all().await?;
        self.delivery_wake.notify_one();
        Ok(forced)
    }

    /// Read-only status for dashboards and CLIs.
    pub async fn status(&self) -> AgentResult<AgentStatus> {
        let events = self.db.events();
        let counts = events.counts().await?;
        let oldest_pending_age = events
            .oldest_pending()
            .await?
            .and_then(|at| (Utc::now() - at).to_std().ok());

        Ok(AgentStatus {
            registration_state: self.registration.registration_state(),
            connectivity: self.connectivity.snapshot(),
            pending_count: counts.outstanding(),
            oldest_pending_age,
            failed_permanent_count: counts.failed_permanent,
            registration_error: self.registration.registration_error().await,
        })
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.registration.identity()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.connectivity.subscribe()
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<Option<DeviceIdentity>> {
        self.registration.subscribe()
    }

    /// Event store access for audit queries.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Stops every worker. In-flight calls get until `grace` to finish;
    /// workers still running then are aborted.
    ///
    /// Events abandoned mid-delivery stay IN_FLIGHT and are requeued on the
    /// next start.
    pub async fn shutdown(self, grace: Duration) {
        info!(grace_ms = grace.as_millis() as u64, "Agent shutting down");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(worker = name, "Worker stopped"),
                Ok(Err(e)) => error!(worker = name, ?e, "Worker ended abnormally"),
                Err(_) => {
                    warn!(worker = name, "Worker missed the shutdown grace period, aborting");
                    task.abort();
                }
            }
        }

        self.db.close().await;
        info!(device_name = %self.config.device.name, "Agent stopped");
    }
}
