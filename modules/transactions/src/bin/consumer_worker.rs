//! Transactions consumer process
//!
//! Completes transactions from relayed messages. Rejected deliveries are
//! recorded in `failed_events`.

use event_bus::Topology;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use transactions_rs::{
    bus::build_bus,
    config::Config,
    consumer::CompleteTransactionHandler,
    db,
    dlq::PgDeadLetterStore,
    shutdown::shutdown_token,
    ConsumerWorker,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting transactions consumer worker...");

    let config = Config::from_env()?;

    let topology = Topology::default();
    let subject = topology.subject.clone();
    let bus = build_bus(&config, topology).map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        e
    })?;

    let pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    if let Err(e) = bus.ensure_topology().await {
        tracing::error!(error = %e, fatal = e.is_fatal(), "Broker setup failed, refusing to start");
        return Err(e.into());
    }

    let worker = ConsumerWorker::new(
        bus.clone(),
        subject,
        Arc::new(CompleteTransactionHandler::new(pool.clone())),
        Arc::new(PgDeadLetterStore::new(pool.clone())),
        config.transient_policy,
        config.broker_io_timeout,
    );

    let result = worker.run(shutdown_token()).await;

    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection cleanly");
    }
    pool.close().await;

    result?;
    tracing::info!("Transactions consumer worker stopped");
    Ok(())
}
