use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use transactions_rs::{
    config::Config,
    db,
    routes::{router, AppState},
    shutdown::shutdown_token,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting transactions API...");

    let config = Config::from_env()?;

    tracing::info!(
        "Configuration loaded: host={}, port={}",
        config.host,
        config.port
    );

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool).await?;

    let app = router(AppState { pool: pool.clone() });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Transactions API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let cancel = shutdown_token();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    pool.close().await;
    tracing::info!("Transactions API stopped");
    Ok(())
}
