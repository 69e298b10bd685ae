//! TimescaleDB connection helper.

use std::time::Duration;

use sqlx::{Connection, PgConnection};
use thiserror::Error;

use crate::config::StoreConfig;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connecting to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("connecting to {url} failed: {source}")]
    Failed {
        url: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Open a single connection, bounded by `config.connect_timeout`.
pub async fn connect(config: &StoreConfig) -> Result<PgConnection, ConnectError> {
    let options = config.connect_options();
    match tokio::time::timeout(config.connect_timeout, PgConnection::connect_with(&options)).await
    {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(source)) => Err(ConnectError::Failed {
            url: config.redacted_url(),
            source,
        }),
        Err(_) => Err(ConnectError::Timeout {
            url: config.redacted_url(),
            timeout: config.connect_timeout,
        }),
    }
}

/// Errors after which the connection can no longer be trusted.
pub fn is_connection_lost(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
    )
}
