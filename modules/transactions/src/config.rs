use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What the consumer does with a delivery whose handler failed transiently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientPolicy {
    /// Reject without requeue and leave a dead-letter record for an operator
    Reject,
    /// Ask the broker to redeliver
    Requeue,
}

impl FromStr for TransientPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(TransientPolicy::Reject),
            "requeue" => Ok(TransientPolicy::Requeue),
            other => Err(format!(
                "CONSUMER_TRANSIENT_POLICY must be 'reject' or 'requeue', got '{}'",
                other
            )),
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// `nats`; `inmemory` only works when relay and consumer share a process
    pub bus_type: String,
    pub nats_url: String,
    pub host: String,
    pub port: u16,
    pub relay: RelayConfig,
    pub housekeeping: HousekeepingConfig,
    pub broker_io_timeout: Duration,
    pub transient_policy: TransientPolicy,
}

/// Relay cycle tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retry_count: i32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            batch_size: 5,
            max_retry_count: 10,
        }
    }
}

/// Outbox retention sweep and stale-claim recovery
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    pub retention_days: i64,
    pub sweep_interval: Duration,
    pub stale_claim_after: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval: Duration::from_secs(3600),
            stale_claim_after: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus_type = env::var("BUS_TYPE")
            .unwrap_or_else(|_| "nats".to_string())
            .to_lowercase();
        if bus_type != "nats" && bus_type != "inmemory" {
            return Err(format!(
                "Invalid BUS_TYPE: {}. Must be 'inmemory' or 'nats'",
                bus_type
            ));
        }

        let nats_url = env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let host = env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = parse_var("PORT", 8080)?;

        let relay = RelayConfig {
            poll_interval: Duration::from_millis(parse_var("RELAY_POLL_INTERVAL_MS", 2000)?),
            batch_size: parse_positive("RELAY_BATCH_SIZE", 5)?,
            max_retry_count: parse_positive("RELAY_MAX_RETRY_COUNT", 10)?,
        };

        let housekeeping = HousekeepingConfig {
            retention_days: parse_positive("OUTBOX_RETENTION_DAYS", 7)?,
            sweep_interval: Duration::from_secs(parse_var("OUTBOX_SWEEP_INTERVAL_SECS", 3600)?),
            stale_claim_after: Duration::from_secs(parse_var("OUTBOX_STALE_CLAIM_SECS", 300)?),
        };

        let broker_io_timeout = Duration::from_millis(parse_var("BROKER_IO_TIMEOUT_MS", 10_000)?);

        let transient_policy = env::var("CONSUMER_TRANSIENT_POLICY")
            .unwrap_or_else(|_| "reject".to_string())
            .parse()?;

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            host,
            port,
            relay,
            housekeeping,
            broker_io_timeout,
            transient_policy,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a valid number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_positive<T>(name: &str, default: T) -> Result<T, String>
where
    T: FromStr + PartialOrd + Default + Copy,
{
    let value = parse_var(name, default)?;
    if value <= T::default() {
        return Err(format!("{} must be greater than zero", name));
    }
    Ok(value)
}
