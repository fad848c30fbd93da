pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_contains, assert_not_contains};
pub use fixtures::{allocator, mock_config, started_server};
pub use logging::init_test_logging;
