//! # Registry / Hub Collaborator
//!
//! The three calls the agent makes to the cloud side, plus a health check
//! used by the hub connectivity probe.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Hub HTTP Contract                                 │
//! │                                                                         │
//! │  POST /devices/register   x-api-key: <fleet key>                       │
//! │       {"deviceId"}                    → {"registryToken"}              │
//! │                                                                         │
//! │  POST /devices/provision                                               │
//! │       {"registryToken"}               → {"hubCredential"}              │
//! │                                                                         │
//! │  POST /events             Authorization: Bearer <hubCredential>        │
//! │                           Idempotency-Key: <deviceId>:<eventId>        │
//! │       {"deviceId","eventId","scannedBarcode","quantity","capturedAt"}  │
//! │                                       → 2xx ack                        │
//! │                                                                         │
//! │  GET  /health                         → 2xx                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Mapping
//! | Response | Kind | Retryable |
//! |----------|------|-----------|
//! | 2xx | ok | - |
//! | 400 / 409 / 422 | `Rejected` | no |
//! | 401 / 403 | `Unauthorized` | no on register/provision, yes on deliver |
//! | 408 / 429 | `RateLimited` | yes |
//! | 5xx | `Server` | yes |
//! | connect / read failure | `Network` / `Timeout` | yes |
//! | anything else | `Unknown` | yes |
//!
//! Delivery is at-least-once; the idempotency key lets the hub discard a
//! redelivery after a crash between send and acknowledge.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use scanlink_core::{ErrorClass, SCAN_QUANTITY};

use crate::error::{AgentError, AgentResult};

// =============================================================================
// Errors
// =============================================================================

/// What went wrong on a hub call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubErrorKind {
    /// Connection could not be made or was dropped.
    Network,
    /// No answer within the request timeout.
    Timeout,
    /// 5xx from the hub.
    Server,
    /// 408 / 429.
    RateLimited,
    /// The hub refused the request content.
    Rejected,
    /// Missing or refused credential.
    Unauthorized,
    /// Unparsable response.
    Protocol,
    /// Unrecognized status.
    Unknown,
}

/// Failure reported by the registry/hub collaborator.
///
/// Every failure says whether it may be retried; the agent never guesses.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HubError {
    pub kind: HubErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl HubError {
    pub fn new(kind: HubErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        HubError {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        HubError::new(
            HubErrorKind::Timeout,
            format!("no response after {}ms", after.as_millis()),
            true,
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        HubError::new(HubErrorKind::Network, message, true)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        HubError::new(HubErrorKind::Rejected, message, false)
    }

    /// Maps the error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::TransientNetwork
        } else {
            ErrorClass::PermanentRejection
        }
    }

    /// True for failures that say nothing about the payload: the network
    /// or the hub as a whole is down.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, HubErrorKind::Network | HubErrorKind::Timeout)
    }

    /// Classifies a non-2xx status.
    pub fn from_status(status: StatusCode, body: &str, unauthorized_retryable: bool) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            format!("HTTP {}: {}", status.as_u16(), truncate(body, 200))
        };

        match status.as_u16() {
            400 | 409 | 422 => HubError::new(HubErrorKind::Rejected, message, false),
            401 | 403 => HubError::new(HubErrorKind::Unauthorized, message, unauthorized_retryable),
            408 | 429 => HubError::new(HubErrorKind::RateLimited, message, true),
            500..=599 => HubError::new(HubErrorKind::Server, message, true),
            _ => HubError::new(HubErrorKind::Unknown, message, true),
        }
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HubError::new(HubErrorKind::Timeout, err.to_string(), true)
        } else if err.is_decode() {
            HubError::new(HubErrorKind::Protocol, err.to_string(), true)
        } else {
            HubError::network(err.to_string())
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// =============================================================================
// Collaborator Trait
// =============================================================================

/// One scan event as handed to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub device_id: String,
    pub event_id: i64,
    pub payload: String,
    pub captured_at: DateTime<Utc>,
}

impl DeliveryRequest {
    /// Stable per-event key the hub uses to discard redeliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.device_id, self.event_id)
    }
}

/// Registry and hub calls.
///
/// Implementations report whether each failure is retryable; anything they
/// cannot classify must come back retryable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Exchanges a device id for a registry token.
    async fn register(&self, device_id: &str) -> HubResult<String>;

    /// Exchanges a registry token for a hub credential.
    async fn provision(&self, registry_token: &str) -> HubResult<String>;

    /// Delivers one event.
    async fn deliver(&self, hub_credential: &str, request: &DeliveryRequest) -> HubResult<()>;

    /// Cheap reachability check.
    async fn health(&self) -> HubResult<()>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    device_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    registry_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionBody<'a> {
    registry_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionResponse {
    hub_credential: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    device_id: &'a str,
    event_id: i64,
    scanned_barcode: &'a str,
    quantity: u32,
    captured_at: String,
}

/// `HubClient` over HTTPS with JSON bodies.
#[derive(Clone)]
pub struct HttpHubClient {
    client: Client,
    base: Url,
    api_key: String,
}

impl std::fmt::Debug for HttpHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHubClient")
            .field("base", &self.base.as_str())
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl HttpHubClient {
    /// Creates a client for `base_url`. Every request is bounded by
    /// `timeout`.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> AgentResult<Self> {
        let mut base = Url::parse(base_url)?;
        // Url::join replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AgentError::Internal(format!("HTTP client: {}", e)))?;

        Ok(HttpHubClient {
            client,
            base,
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> HubResult<Url> {
        self.base
            .join(path)
            .map_err(|e| HubError::new(HubErrorKind::Unknown, e.to_string(), false))
    }

    async fn read_failure(response: reqwest::Response, unauthorized_retryable: bool) -> HubError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        HubError::from_status(status, &body, unauthorized_retryable)
    }
}

#[async_trait]
impl HubClient for HttpHubClient {
    async fn register(&self, device_id: &str) -> HubResult<String> {
        let url = self.endpoint("devices/register")?;
        debug!(%device_id, %url, "Registering device");

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .json(&RegisterBody { device_id })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response, false).await);
        }

        let body: RegisterResponse = response.json().await?;
        Ok(body.registry_token)
    }

    async fn provision(&self, registry_token: &str) -> HubResult<String> {
        let url = self.endpoint("devices/provision")?;

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .json(&ProvisionBody { registry_token })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response, false).await);
        }

        let body: ProvisionResponse = response.json().await?;
        Ok(body.hub_credential)
    }

    async fn deliver(&self, hub_credential: &str, request: &DeliveryRequest) -> HubResult<()> {
        let url = self.endpoint("events")?;

        let body = EventBody {
            device_id: &request.device_id,
            event_id: request.event_id,
            scanned_barcode: &request.payload,
            quantity: SCAN_QUANTITY,
            captured_at: request
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(hub_credential)
            .header("Idempotency-Key", request.idempotency_key())
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        // A revoked credential is not the event's fault
        let err = Self::read_failure(response, true).await;
        if err.kind == HubErrorKind::Unauthorized {
            warn!(event_id = request.event_id, "Hub refused credential");
        }
        Err(err)
    }

    async fn health(&self) -> HubResult<()> {
        let url = self.endpoint("health")?;
        let response = self.client.get(url).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::read_failure(response, true).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let rejected = HubError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad ean", true);
        assert_eq!(rejected.kind, HubErrorKind::Rejected);
        assert!(!rejected.retryable);
        assert!(rejected.message.contains("bad ean"));

        assert!(!HubError::from_status(StatusCode::CONFLICT, "", true).retryable);
        assert!(!HubError::from_status(StatusCode::BAD_REQUEST, "", true).retryable);

        assert!(HubError::from_status(StatusCode::SERVICE_UNAVAILABLE, "", false).retryable);
        assert!(HubError::from_status(StatusCode::TOO_MANY_REQUESTS, "", false).retryable);
        assert!(HubError::from_status(StatusCode::REQUEST_TIMEOUT, "", false).retryable);
    }

    #[test]
    fn test_unknown_status_is_retryable() {
        let err = HubError::from_status(StatusCode::IM_A_TEAPOT, "", false);
        assert_eq!(err.kind, HubErrorKind::Unknown);
        assert!(err.retryable);
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
    }

    #[test]
    fn test_unauthorized_depends_on_call() {
        assert!(!HubError::from_status(StatusCode::UNAUTHORIZED, "", false).retryable);
        assert!(HubError::from_status(StatusCode::FORBIDDEN, "", true).retryable);
    }

    #[test]
    fn test_idempotency_key() {
        let request = DeliveryRequest {
            device_id: "dev-0123456789ab".to_string(),
            event_id: 42,
            payload: "4006381333931".to_string(),
            captured_at: Utc::now(),
        };
        assert_eq!(request.idempotency_key(), "dev-0123456789ab:42");
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client =
            HttpHubClient::new("https://hub.example.com/api", "k", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.endpoint("events").unwrap().as_str(),
            "https://hub.example.com/api/events"
        );
    }

    #[test]
    fn test_event_body_shape() {
        let body = EventBody {
            device_id: "dev-0123456789ab",
            event_id: 7,
            scanned_barcode: "4006381333931",
            quantity: SCAN_QUANTITY,
            captured_at: "2026-01-01T00:00:00.000Z".to_string(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["scannedBarcode"], "4006381333931");
        assert_eq!(json["quantity"], 1);
        assert_eq!(json["eventId"], 7);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let client =
            HttpHubClient::new("https://hub.example.com", "secret-key", Duration::from_secs(1))
                .unwrap();
        assert!(!format!("{:?}", client).contains("secret-key"));
    }
}
