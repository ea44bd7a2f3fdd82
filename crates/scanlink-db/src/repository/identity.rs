//! # Device Identity Repository
//!
//! Single-row storage of the device id and registration material.
//!
//! Every update is guarded in SQL on the state it expects to leave, so the
//! stored registration state can only move forward even if two writers race.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

use scanlink_core::{DeviceIdentity, RegistrationState};

use super::{from_millis, to_millis};
use crate::error::{DbError, DbResult};

const IDENTITY_COLUMNS: &str = "device_id, registration_state, registry_token, hub_credential, \
     fatal_error, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct DeviceIdentityRow {
    device_id: String,
    registration_state: RegistrationState,
    registry_token: Option<String>,
    hub_credential: Option<String>,
    fatal_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<DeviceIdentityRow> for DeviceIdentity {
    fn from(row: DeviceIdentityRow) -> Self {
        DeviceIdentity {
            device_id: row.device_id,
            registration_state: row.registration_state,
            registry_token: row.registry_token,
            hub_credential: row.hub_credential,
            fatal_error: row.fatal_error,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

/// Repository for the device identity row.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdentityRepository { pool }
    }

    /// Loads the persisted identity, if any.
    pub async fn load(&self) -> DbResult<Option<DeviceIdentity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM device_identity WHERE id = 1");

        let row: Option<DeviceIdentityRow> =
            sqlx::query_as(&sql).fetch_optional(&self.pool).await?;

        Ok(row.map(DeviceIdentity::from))
    }

    async fn load_required(&self) -> DbResult<DeviceIdentity> {
        self.load()
            .await?
            .ok_or_else(|| DbError::not_found("DeviceIdentity", "1"))
    }

    /// Persists a freshly derived device id as REGISTERED_LOCAL.
    ///
    /// If a row already exists it is kept, except that a row with no
    /// registry token or hub credential takes the new id. Returns the row as
    /// stored afterwards.
    pub async fn create_local(&self, device_id: &str) -> DbResult<DeviceIdentity> {
        let now = to_millis(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO device_identity (
                id, device_id, registration_state, created_at, updated_at
            ) VALUES (1, ?1, 'REGISTERED_LOCAL', ?2, ?2)
            ON CONFLICT (id) DO UPDATE SET
                device_id = excluded.device_id,
                updated_at = excluded.updated_at
            WHERE device_identity.registry_token IS NULL
              AND device_identity.hub_credential IS NULL
              AND device_identity.device_id <> excluded.device_id
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let stored = self.load_required().await?;
        if stored.device_id != device_id {
            warn!(
                stored = %stored.device_id,
                derived = %device_id,
                "Keeping registered device id; hardware-derived id differs"
            );
        }
        Ok(stored)
    }

    /// REGISTERED_LOCAL → REGISTERED_REMOTE with the registry token.
    pub async fn record_registered(&self, registry_token: &str) -> DbResult<DeviceIdentity> {
        let result = sqlx::query(
            r#"
            UPDATE device_identity SET
                registration_state = 'REGISTERED_REMOTE',
                registry_token = ?1,
                fatal_error = NULL,
                updated_at = ?2
            WHERE id = 1 AND registration_state = 'REGISTERED_LOCAL'
            "#,
        )
        .bind(registry_token)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.expect_advanced(result.rows_affected(), RegistrationState::RegisteredLocal)?;
        info!("Device registered with registry");
        self.load_required().await
    }

    /// REGISTERED_REMOTE → PROVISIONED with the hub credential.
    pub async fn record_provisioned(&self, hub_credential: &str) -> DbResult<DeviceIdentity> {
        let result = sqlx::query(
            r#"
            UPDATE device_identity SET
                registration_state = 'PROVISIONED',
                hub_credential = ?1,
                fatal_error = NULL,
                updated_at = ?2
            WHERE id = 1 AND registration_state = 'REGISTERED_REMOTE'
            "#,
        )
        .bind(hub_credential)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.expect_advanced(result.rows_affected(), RegistrationState::RegisteredRemote)?;
        info!("Device provisioned for hub delivery");
        self.load_required().await
    }

    /// Records a non-retryable registration failure. State is unchanged.
    pub async fn record_fatal(&self, error: &str) -> DbResult<()> {
        sqlx::query("UPDATE device_identity SET fatal_error = ?1, updated_at = ?2 WHERE id = 1")
            .bind(error)
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn expect_advanced(&self, rows: u64, expected: RegistrationState) -> DbResult<()> {
        if rows == 0 {
            return Err(DbError::invalid_transition(
                "DeviceIdentity",
                "1",
                expected.as_str(),
            ));
        }
        Ok(())
    }
}
