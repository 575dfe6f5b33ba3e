//! Shared setup for the client integration tests

use std::time::Duration;

use switchyard_client::{Client, ClientConfig};
use switchyard_messaging_memory::{MemoryBroker, MemoryConnection};

/// Routes test logs through the test writer. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// One-second timeout, two retries, three routees.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        client_id: "test-client".to_string(),
        rpc_timeout_secs: 1,
        rpc_retries: 2,
        nb_routees: 3,
        ..ClientConfig::default()
    }
}

/// A fresh broker and a client connected to it.
pub fn memory_client(config: ClientConfig) -> (MemoryBroker, Client<MemoryConnection>) {
    init_test_logging();

    let broker = MemoryBroker::new();
    let client = Client::new(broker.connect(), config).unwrap();
    (broker, client)
}

/// Polls `condition` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
