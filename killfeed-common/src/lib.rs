pub mod config;
pub mod cursor;
pub mod dedup;
pub mod health;
pub mod log;
pub mod logging;
pub mod metrics;
pub mod record;
pub mod shutdown;
pub mod test_utils;

/// Reported in the ESI user agent and on `/version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
