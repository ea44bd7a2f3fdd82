//! # scanlink-db: Durable Event Store
//!
//! SQLite-backed storage for scan events and the device identity.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ScanLink Data Flow                               │
//! │                                                                         │
//! │  Capture collaborator ── append(payload) ──┐                           │
//! │                                            ▼                            │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   scanlink-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌─────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories   │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                 │   │  (embedded)  │  │   │
//! │  │   │               │◄───│ EventRepository │   │ 001_scan_    │  │   │
//! │  │   │ SqlitePool    │    │ IdentityRepo    │   │   events.sql │  │   │
//! │  │   │ WAL + FULL    │    │                 │   │ 002_device_  │  │   │
//! │  │   └───────────────┘    └─────────────────┘   │   identity   │  │   │
//! │  │                                              └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                            ▲                            │
//! │  Delivery engine ── mark_* / list_* ───────┘                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scanlink_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("/var/lib/scanlink/events.db").capacity(50_000)).await?;
//!
//! let event = db.events().append("4006381333931").await?;
//! let batch = db.events().list_pending(50).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::events::{EventCounts, EventRepository};
pub use repository::identity::IdentityRepository;
