//! # Scan Event Repository
//!
//! The durable store-and-forward queue.
//!
//! ## Event Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    scan_events state machine                            │
//! │                                                                         │
//! │  append ──► PENDING ──mark_in_flight──► IN_FLIGHT                      │
//! │               ▲                            │                            │
//! │               │                            ├─mark_delivered──► DELIVERED│
//! │               │◄──────mark_retry───────────┤                            │
//! │               │   (next_attempt_at set)    └─mark_permanent_failure──►  │
//! │               │                                    FAILED_PERMANENT     │
//! │               │                                                         │
//! │  startup: reset_in_flight_on_startup() moves IN_FLIGHT back ────┘      │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • append is one INSERT; it returns only after the row is durable      │
//! │  • every mark_* is a single UPDATE guarded on the expected state       │
//! │  • rows are never deleted here                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use scanlink_core::validation::validate_payload;
use scanlink_core::{DeliveryState, ScanEvent};

use super::{from_millis, to_millis};
use crate::error::{DbError, DbResult};

/// Maximum stored length of `last_error`.
const MAX_ERROR_LEN: usize = 512;

const EVENT_COLUMNS: &str = "id, payload, captured_at, device_id, delivery_state, \
     attempt_count, last_attempt_at, last_error, next_attempt_at";

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ScanEventRow {
    id: i64,
    payload: String,
    captured_at: i64,
    device_id: Option<String>,
    delivery_state: DeliveryState,
    attempt_count: i64,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
    next_attempt_at: i64,
}

impl From<ScanEventRow> for ScanEvent {
    fn from(row: ScanEventRow) -> Self {
        ScanEvent {
            id: row.id,
            payload: row.payload,
            captured_at: from_millis(row.captured_at),
            device_id: row.device_id,
            delivery_state: row.delivery_state,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(u32::MAX),
            last_attempt_at: row.last_attempt_at.map(from_millis),
            last_error: row.last_error,
            next_attempt_at: from_millis(row.next_attempt_at),
        }
    }
}

/// Per-state event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub failed_permanent: u64,
}

impl EventCounts {
    /// Events not yet in a terminal state.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight
    }
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}

fn as_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for scan event operations.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
    capacity: u64,
}

impl EventRepository {
    pub fn new(pool: SqlitePool, capacity: u64) -> Self {
        EventRepository { pool, capacity }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Appends a scan to the queue.
    ///
    /// The capacity check and the insert are one statement, so concurrent
    /// appends cannot overshoot the ceiling. The device id is copied from the
    /// identity row when one exists.
    ///
    /// ## Errors
    /// - `InvalidPayload` for empty, oversized or control-character payloads
    /// - `StoreFull` when outstanding events reached capacity
    pub async fn append(&self, payload: &str) -> DbResult<ScanEvent> {
        let payload = validate_payload(payload)?;
        let now = to_millis(Utc::now());
        let capacity = i64::try_from(self.capacity).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            INSERT INTO scan_events (
                payload, captured_at, device_id, delivery_state,
                attempt_count, next_attempt_at
            )
            SELECT ?1, ?2, (SELECT device_id FROM device_identity WHERE id = 1), 'PENDING', 0, ?2
            WHERE (
                SELECT COUNT(*) FROM scan_events
                WHERE delivery_state IN ('PENDING', 'IN_FLIGHT')
            ) < ?3
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let row: Option<ScanEventRow> = sqlx::query_as(&sql)
            .bind(payload)
            .bind(now)
            .bind(capacity)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let event = ScanEvent::from(row);
                debug!(event_id = event.id, "Scan event appended");
                Ok(event)
            }
            None => {
                let outstanding = self.count_outstanding().await?;
                warn!(outstanding, capacity = self.capacity, "Event store full, scan refused");
                Err(DbError::StoreFull {
                    outstanding,
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Fetches one event by id.
    pub async fn get(&self, id: i64) -> DbResult<Option<ScanEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM scan_events WHERE id = ?1");

        let row: Option<ScanEventRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ScanEvent::from))
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// PENDING → IN_FLIGHT. Returns the new attempt count.
    pub async fn mark_in_flight(&self, id: i64, now: DateTime<Utc>) -> DbResult<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE scan_events SET
                delivery_state = 'IN_FLIGHT',
                attempt_count = attempt_count + 1,
                last_attempt_at = ?2
            WHERE id = ?1 AND delivery_state = 'PENDING'
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .ok_or_else(|| {
                DbError::invalid_transition("ScanEvent", id.to_string(), DeliveryState::Pending.as_str())
            })
    }

    /// IN_FLIGHT → DELIVERED.
    pub async fn mark_delivered(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_events SET
                delivery_state = 'DELIVERED',
                last_error = NULL
            WHERE id = ?1 AND delivery_state = 'IN_FLIGHT'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.expect_one(result.rows_affected(), id)
    }

    /// IN_FLIGHT → PENDING, not eligible again before `next_attempt_at`.
    pub async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_events SET
                delivery_state = 'PENDING',
                last_error = ?2,
                next_attempt_at = ?3
            WHERE id = ?1 AND delivery_state = 'IN_FLIGHT'
            "#,
        )
        .bind(id)
        .bind(truncate_error(error))
        .bind(to_millis(next_attempt_at))
        .execute(&self.pool)
        .await?;

        self.expect_one(result.rows_affected(), id)
    }

    /// IN_FLIGHT → FAILED_PERMANENT. The row stays for audit.
    pub async fn mark_permanent_failure(&self, id: i64, error: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_events SET
                delivery_state = 'FAILED_PERMANENT',
                last_error = ?2
            WHERE id = ?1 AND delivery_state = 'IN_FLIGHT'
            "#,
        )
        .bind(id)
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await?;

        self.expect_one(result.rows_affected(), id)
    }

    fn expect_one(&self, rows: u64, id: i64) -> DbResult<()> {
        if rows == 0 {
            return Err(DbError::invalid_transition(
                "ScanEvent",
                id.to_string(),
                DeliveryState::InFlight.as_str(),
            ));
        }
        Ok(())
    }

    /// Moves every IN_FLIGHT row back to PENDING and makes it eligible now.
    ///
    /// Called once before any worker starts. Returns the number of rows reset;
    /// a second call in a row returns 0.
    pub async fn reset_in_flight_on_startup(&self) -> DbResult<u64> {
        let now = to_millis(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE scan_events SET
                delivery_state = 'PENDING',
                next_attempt_at = MIN(next_attempt_at, ?1)
            WHERE delivery_state = 'IN_FLIGHT'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(count = reset, "Reset interrupted deliveries to PENDING");
        }
        Ok(reset)
    }

    /// Stamps the current device id on events appended before identity
    /// existed, and on outstanding events still carrying a replaced id.
    ///
    /// Delivered and rejected rows keep the id they were sent under.
    pub async fn backfill_device_id(&self, device_id: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_events SET device_id = ?1
            WHERE device_id IS NULL
               OR (device_id <> ?1 AND delivery_state IN ('PENDING', 'IN_FLIGHT'))
            "#,
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// IN_FLIGHT → PENDING without touching the eligibility time.
    ///
    /// Used when an attempt's outcome could not be recorded, so the event is
    /// not stranded in flight until the next restart. Returns false when the
    /// row was no longer IN_FLIGHT.
    pub async fn release_in_flight(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE scan_events SET delivery_state = 'PENDING' \
             WHERE id = ?1 AND delivery_state = 'IN_FLIGHT'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Makes every backing-off PENDING event eligible immediately.
    ///
    /// Attempt counts and last errors are kept. Returns the number of events
    /// whose wait was cut short.
    pub async fn force_retry_all(&self) -> DbResult<u64> {
        let now = to_millis(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE scan_events SET next_attempt_at = ?1
            WHERE delivery_state = 'PENDING' AND next_attempt_at > ?1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let forced = result.rows_affected();
        if forced > 0 {
            info!(count = forced, "Cleared retry backoff for pending events");
        }
        Ok(forced)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// PENDING events in id (capture) order, including ones backing off.
    pub async fn list_pending(&self, limit: u32) -> DbResult<Vec<ScanEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM scan_events \
             WHERE delivery_state = 'PENDING' ORDER BY id ASC LIMIT ?1"
        );

        let rows: Vec<ScanEventRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ScanEvent::from).collect())
    }

    /// PENDING events whose backoff has elapsed, in id order.
    ///
    /// Events still backing off are skipped rather than blocking the ones
    /// behind them.
    pub async fn list_eligible(&self, now: DateTime<Utc>, limit: u32) -> DbResult<Vec<ScanEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM scan_events \
             WHERE delivery_state = 'PENDING' AND next_attempt_at <= ?1 \
             ORDER BY id ASC LIMIT ?2"
        );

        let rows: Vec<ScanEventRow> = sqlx::query_as(&sql)
            .bind(to_millis(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ScanEvent::from).collect())
    }

    /// Events of any state with an id above `after_id`, in id order.
    pub async fn list_after(&self, after_id: i64, limit: u32) -> DbResult<Vec<ScanEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM scan_events WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        );

        let rows: Vec<ScanEventRow> = sqlx::query_as(&sql)
            .bind(after_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ScanEvent::from).collect())
    }

    /// Highest event id, or 0 for an empty store.
    pub async fn max_id(&self) -> DbResult<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM scan_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(max.unwrap_or(0))
    }

    /// Earliest future eligibility time among PENDING events.
    pub async fn next_retry_at(&self, now: DateTime<Utc>) -> DbResult<Option<DateTime<Utc>>> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_attempt_at) FROM scan_events \
             WHERE delivery_state = 'PENDING' AND next_attempt_at > ?1",
        )
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        Ok(next.map(from_millis))
    }

    /// Events in PENDING or IN_FLIGHT.
    pub async fn count_outstanding(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scan_events WHERE delivery_state IN ('PENDING', 'IN_FLIGHT')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(as_count(count))
    }

    /// Per-state counts.
    pub async fn counts(&self) -> DbResult<EventCounts> {
        let rows: Vec<(DeliveryState, i64)> = sqlx::query_as(
            "SELECT delivery_state, COUNT(*) FROM scan_events GROUP BY delivery_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = EventCounts::default();
        for (state, count) in rows {
            let count = as_count(count);
            match state {
                DeliveryState::Pending => counts.pending = count,
                DeliveryState::InFlight => counts.in_flight = count,
                DeliveryState::Delivered => counts.delivered = count,
                DeliveryState::FailedPermanent => counts.failed_permanent = count,
            }
        }
        Ok(counts)
    }

    /// Capture time of the oldest outstanding event.
    pub async fn oldest_pending(&self) -> DbResult<Option<DateTime<Utc>>> {
        let oldest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(captured_at) FROM scan_events \
             WHERE delivery_state IN ('PENDING', 'IN_FLIGHT')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(oldest.map(from_millis))
    }
}

// =============================================================================
// Tests
// =============================================================================
