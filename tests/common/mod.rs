// Shared test support for integration tests

pub mod test_helpers;

pub use mock_services::*;
pub use test_helpers::*;
