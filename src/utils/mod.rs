//! Ambient utilities: logging setup and retry backoff

pub mod logging;
pub mod retry;

pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use retry::{retry_async_with_backoff, RetryConfig};
