use event_bus::{EventBus, NatsBus, Topology};
use std::sync::Arc;

use crate::config::Config;

/// Create the event bus selected by `BUS_TYPE` for a worker process
///
/// The relay and the consumer run as separate processes, so a process-local
/// queue would accept every publish and never deliver it. `inmemory` is
/// refused here and only used by wiring the in-memory pieces in one process,
/// as the tests do.
///
/// The NATS bus connects lazily; call `ensure_topology` to surface broker
/// problems at startup.
pub fn build_bus(config: &Config, topology: Topology) -> Result<Arc<dyn EventBus>, String> {
    match config.bus_type.as_str() {
        "nats" => {
            tracing::info!(
                nats_url = %config.nats_url,
                stream = %topology.stream,
                subject = %topology.subject,
                consumer = %topology.consumer,
                "Using NATS JetStream event bus"
            );
            Ok(Arc::new(NatsBus::new(
                config.nats_url.clone(),
                topology,
                config.broker_io_timeout,
            )))
        }
        other => Err(format!(
            "BUS_TYPE={} cannot be used by a standalone worker: the relay and consumer \
             would not share the queue. Use BUS_TYPE=nats",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn config_with_bus(bus_type: &str) -> Config {
        env::set_var("DATABASE_URL", "postgres://localhost/transactions");
        env::set_var("BUS_TYPE", bus_type);
        let config = Config::from_env().unwrap();
        env::remove_var("BUS_TYPE");
        env::remove_var("DATABASE_URL");
        config
    }

    #[test]
    #[serial]
    fn test_workers_refuse_inmemory_bus() {
        let config = config_with_bus("inmemory");

        let err = build_bus(&config, Topology::default()).err().unwrap();
        assert!(err.contains("BUS_TYPE=inmemory"));
    }

    #[test]
    #[serial]
    fn test_workers_build_nats_bus() {
        let config = config_with_bus("nats");

        assert!(build_bus(&config, Topology::default()).is_ok());
    }
}
