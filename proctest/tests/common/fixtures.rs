use std::sync::{Arc, OnceLock};
use std::time::Duration;

use proctest_common::{HarnessConfig, PortAllocator, ServerInstance};

/// Harness settings pointing at the mock binaries built with this package.
pub fn mock_config() -> HarnessConfig {
    HarnessConfig::default()
        .with_client_binary(env!("CARGO_BIN_EXE_proctest-mock-client"))
        .with_server_binary(env!("CARGO_BIN_EXE_proctest-mock-server"))
        .with_server_address("127.0.0.1")
        .with_server_startup(100, Duration::from_millis(50))
        .with_default_timeout(Duration::from_secs(10))
}

/// One allocator for every test in this binary, so parallel tests never
/// share a port.
pub fn allocator() -> Arc<PortAllocator> {
    static ALLOCATOR: OnceLock<Arc<PortAllocator>> = OnceLock::new();
    Arc::clone(ALLOCATOR.get_or_init(|| Arc::new(PortAllocator::new())))
}

pub fn started_server() -> ServerInstance {
    crate::test_log!("FIXTURE: starting mock server");
    let mut server =
        ServerInstance::new(&mock_config(), allocator()).expect("Failed to create server");
    server.start().expect("Failed to start server");
    server
}
