//! Outbox relay process
//!
//! Publishes committed outbox rows to the broker and runs outbox
//! housekeeping. Any number of instances may run against the same database.
//!
//! Exits non-zero when the broker topology cannot be declared at startup so
//! a supervisor can restart it.

use event_bus::Topology;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use transactions_rs::{
    bus::build_bus,
    config::Config,
    db,
    outbox_store::{OutboxStore, PgOutboxStore},
    shutdown::shutdown_token,
    Housekeeper, OutboxPublisher, RelayWorker,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting outbox relay worker...");

    let config = Config::from_env()?;

    let topology = Topology::default();
    let subject = topology.subject.clone();
    let bus = build_bus(&config, topology).map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        e
    })?;

    let pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let publisher = OutboxPublisher::new(bus, subject);

    if let Err(e) = publisher.ensure_topology().await {
        tracing::error!(error = %e, fatal = e.is_fatal(), "Broker setup failed, refusing to start");
        return Err(e.into());
    }

    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
    let cancel = shutdown_token();

    let housekeeper = Housekeeper::new(store.clone(), config.housekeeping.clone());
    let housekeeping_cancel = cancel.clone();
    let housekeeping = tokio::spawn(async move { housekeeper.run(housekeeping_cancel).await });

    let relay = RelayWorker::new(
        store,
        publisher.clone(),
        config.relay.clone(),
        config.broker_io_timeout,
    );
    relay.run(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = housekeeping.await {
        tracing::error!(error = %e, "Housekeeping task panicked");
    }

    if let Err(e) = publisher.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection cleanly");
    }
    pool.close().await;

    tracing::info!("Outbox relay worker stopped");
    Ok(())
}
