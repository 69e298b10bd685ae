//! Persistence writer: one insert and one commit per reading.
//!
//! The writer owns the long-lived store connection. When a write fails with a
//! connection-class error the broken connection is discarded, and the next
//! write makes a single reconnect attempt before inserting. The reading whose
//! write failed is dropped; nothing is retried.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::Reading;
use crate::config::StoreConfig;
use crate::sink::ReadingSink;
use crate::store::{self, ConnectError};

const INSERT_READING: &str = r#"
    INSERT INTO sensor_metrics (time, device_id, path, value)
    VALUES ($1, $2, $3, $4)
"#;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] ConnectError),
    #[error("insert failed: {0}")]
    Insert(#[source] sqlx::Error),
    #[error("commit failed: {0}")]
    Commit(#[source] sqlx::Error),
}

impl WriteError {
    /// True when the store connection itself is gone, as opposed to a
    /// rejected statement.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            WriteError::Unavailable(_) => true,
            WriteError::Insert(e) | WriteError::Commit(e) => store::is_connection_lost(e),
        }
    }
}

/// Production sink writing to the `sensor_metrics` table.
pub struct PgWriter {
    config: StoreConfig,
    conn: Option<PgConnection>,
}

impl PgWriter {
    /// Open the writer's connection. Failure here is fatal to startup.
    pub async fn connect(config: &StoreConfig) -> Result<Self, ConnectError> {
        let conn = store::connect(config).await?;
        info!(url = %config.redacted_url(), "TimescaleDB data ingest connection open");
        Ok(Self {
            config: config.clone(),
            conn: Some(conn),
        })
    }

    /// Release the connection.
    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "error closing TimescaleDB connection");
            }
        }
        info!("TimescaleDB data ingest connection is closed");
    }

    async fn take_connection(&mut self) -> Result<PgConnection, WriteError> {
        if let Some(conn) = self.conn.take() {
            return Ok(conn);
        }
        info!(url = %self.config.redacted_url(), "reconnecting to TimescaleDB");
        let conn = store::connect(&self.config).await?;
        info!("TimescaleDB connection re-established");
        Ok(conn)
    }
}

async fn insert_and_commit(conn: &mut PgConnection, reading: &Reading) -> Result<(), WriteError> {
    let mut tx = conn.begin().await.map_err(WriteError::Insert)?;

    let affected = sqlx::query(INSERT_READING)
        .bind(reading.time)
        .bind(&reading.device_id)
        .bind(&reading.path)
        .bind(reading.value)
        .execute(&mut *tx)
        .await
        .map_err(WriteError::Insert)?
        .rows_affected();

    if affected != 1 {
        warn!(affected, "row count was not equal to 1");
    }

    tx.commit().await.map_err(WriteError::Commit)
}

#[async_trait]
impl ReadingSink for PgWriter {
    async fn write(&mut self, reading: &Reading) -> Result<(), WriteError> {
        let mut conn = self.take_connection().await?;

        match insert_and_commit(&mut conn, reading).await {
            Ok(()) => {
                debug!(
                    time = %reading.time,
                    device_id = %reading.device_id,
                    path = %reading.path,
                    value = ?reading.value,
                    "sql insert"
                );
                self.conn = Some(conn);
                Ok(())
            }
            Err(e) if e.is_connection_lost() => {
                warn!(error = %e, "TimescaleDB connection lost; will reconnect on next write");
                Err(e)
            }
            Err(e) => {
                self.conn = Some(conn);
                Err(e)
            }
        }
    }
}
