use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config::ENVIRONMENT_PRODUCTION;

/// Install the global subscriber.
///
/// Level comes from `RUST_LOG` (default INFO). Warnings and errors go to
/// stderr, everything else to stdout, so the two can be routed separately.
/// Production emits JSON lines.
pub fn init(environment: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    if environment == ENVIRONMENT_PRODUCTION {
        builder.json().init();
    } else {
        builder.init();
    }
}
