//! `sensor_metrics` schema initialisation.
//!
//! Runs once at startup on its own short-lived connection. Every statement is
//! idempotent, so it is safe on every start and a failed run is simply
//! retried by the next one.

use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::store::{self, ConnectError};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS sensor_metrics (
        time      TIMESTAMP WITHOUT TIME ZONE NOT NULL,
        device_id TEXT NOT NULL,
        path      TEXT NOT NULL,
        value     DOUBLE PRECISION NULL
    )
"#;

const TIMESCALE_INSTALLED: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')";

const CREATE_HYPERTABLE: &str =
    "SELECT create_hypertable('sensor_metrics', 'time', if_not_exists => TRUE, migrate_data => TRUE)";

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to create sensor_metrics: {0}")]
    CreateTable(#[source] sqlx::Error),
    #[error("failed to convert sensor_metrics to a hypertable: {0}")]
    Hypertable(#[source] sqlx::Error),
}

/// What the initializer left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// Table exists and is a hypertable on `time`.
    Hypertable,
    /// Table exists; the store has no TimescaleDB extension.
    PlainTable,
}

/// Ensure `sensor_metrics` exists and is time-partitioned.
pub async fn initialize(config: &StoreConfig) -> Result<SchemaState, InitError> {
    let mut conn = store::connect(config).await?;
    let result = apply(&mut conn).await;
    if let Err(e) = conn.close().await {
        warn!(error = %e, "error closing schema connection");
    }
    debug!("TimescaleDB schema connection is closed");
    result
}

async fn apply(conn: &mut PgConnection) -> Result<SchemaState, InitError> {
    sqlx::query(CREATE_TABLE)
        .execute(&mut *conn)
        .await
        .map_err(InitError::CreateTable)?;

    let timescale: bool = sqlx::query_scalar(TIMESCALE_INSTALLED)
        .fetch_one(&mut *conn)
        .await
        .map_err(InitError::Hypertable)?;

    if !timescale {
        return Ok(SchemaState::PlainTable);
    }

    sqlx::query(CREATE_HYPERTABLE)
        .execute(&mut *conn)
        .await
        .map_err(InitError::Hypertable)?;

    Ok(SchemaState::Hypertable)
}

/// Best-effort wrapper used at startup: failures are logged, never raised.
pub async fn ensure(config: &StoreConfig) -> Option<SchemaState> {
    match initialize(config).await {
        Ok(SchemaState::Hypertable) => {
            info!("sensor_metrics hypertable ready");
            Some(SchemaState::Hypertable)
        }
        Ok(SchemaState::PlainTable) => {
            warn!("timescaledb extension not installed; sensor_metrics left as a plain table");
            Some(SchemaState::PlainTable)
        }
        Err(e) => {
            warn!(error = %e, "schema initialisation failed (non-fatal)");
            None
        }
    }
}
