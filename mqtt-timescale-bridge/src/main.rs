//! MQTT → TimescaleDB bridge entry point.
//!
//! Startup order: configuration, schema initialisation (best effort), the
//! writer's store connection (fatal on failure), then the MQTT receive loop,
//! which blocks until SIGINT / SIGTERM or a fatal broker error.
//!
//! Options are listed in [`mqtt_timescale_bridge::config`]; `RUST_LOG`
//! overrides the default `mqtt_timescale_bridge=info` filter.

use anyhow::Result;
use tracing::{error, info, warn};

use mqtt_timescale_bridge::config::BridgeConfig;
use mqtt_timescale_bridge::pipeline::Pipeline;
use mqtt_timescale_bridge::schema;
use mqtt_timescale_bridge::shutdown::Shutdown;
use mqtt_timescale_bridge::subscriber::{RumqttTransport, SubscriptionClient};
use mqtt_timescale_bridge::writer::PgWriter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mqtt_timescale_bridge=info".parse()?),
        )
        .json()
        .init();

    let config = BridgeConfig::load().inspect_err(|e| error!(error = %e, "invalid configuration"))?;
    for issue in &config.warnings {
        warn!(error = %issue, "questionable configuration; continuing");
    }
    let mut shutdown = Shutdown::install()?;

    info!(url = %config.store.redacted_url(), "TimescaleDB connection");
    info!(url = %config.broker.redacted_url(), client_id = %config.broker.client_id, "MQTT connection");

    schema::ensure(&config.store).await;

    let writer = PgWriter::connect(&config.store)
        .await
        .inspect_err(|e| error!(error = %e, "cannot open TimescaleDB data ingest connection"))?;

    let mut pipeline = Pipeline::new(writer);
    let mut client = SubscriptionClient::new(
        RumqttTransport::new(&config.broker),
        config.broker.topic.clone(),
        config.broker.reconnect_delay,
    );

    let result = tokio::select! {
        r = client.run(&mut pipeline) => r,
        signal = shutdown.recv() => {
            info!(%signal, "shutdown signal received");
            Ok(())
        }
    };

    let stats = pipeline.stats();
    info!(
        received = stats.received,
        stored = stats.stored,
        decode_failed = stats.decode_failed,
        write_failed = stats.write_failed,
        "bridge stopped"
    );
    pipeline.into_sink().close().await;

    if let Err(e) = &result {
        error!(error = %e, "MQTT receive loop failed");
    }
    result?;
    Ok(())
}
