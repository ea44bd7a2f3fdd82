//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Agent worker                                                          │
//! │       │  db.events().list_eligible(now, 50)                             │
//! │       ▼                                                                 │
//! │  EventRepository ──────────┐      IdentityRepository ──────┐           │
//! │  ├── append                │      ├── load                 │           │
//! │  ├── mark_in_flight        │      ├── create_local         │           │
//! │  ├── mark_delivered        │      ├── record_registered    │           │
//! │  ├── mark_retry            │      ├── record_provisioned   │           │
//! │  ├── mark_permanent_failure│      └── record_fatal         │           │
//! │  └── list_* / counts       │                               │           │
//! │                            ▼                               ▼           │
//! │                 scan_events table            device_identity table      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps are stored as Unix epoch milliseconds so eligibility checks
//! are plain integer comparisons in SQL.

pub mod events;
pub mod identity;

use chrono::{DateTime, Utc};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
