//! Reads the killmail log through a consumer group and logs what it sees.
//! Useful to check a deployment end to end.
use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use killfeed_common::config::StreamConfig;
use killfeed_common::log::{Entry, RedisStreamLog};
use killfeed_common::record::{Record, RecordError};
use killfeed_common::{logging, shutdown};

const GROUP: &str = "killfeed:noopconsumer";
const CONSUMER: &str = "any";
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Envconfig)]
struct Config {
    #[envconfig(default = "development")]
    environment: String,

    #[envconfig(nested = true)]
    stream: StreamConfig,
}

fn killmail_id(entry: &Entry) -> Result<i64, RecordError> {
    Ok(Record::from_entry(entry)?.killmail.killmail_id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().expect("Invalid configuration:");
    logging::init(&config.environment);

    let log = RedisStreamLog::new(
        config.stream.redis_url.as_str(),
        config.stream.stream_key.as_str(),
        config.stream.stream_max_length,
        config.stream.stream_max_blocking_reads,
    )
    .await
    .context("failed to connect to the killmail log")?;

    log.create_group(GROUP)
        .await
        .context("failed to create consumer group")?;
    log.create_consumer(GROUP, CONSUMER)
        .await
        .context("failed to create consumer")?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    info!(group = GROUP, stream_key = log.key(), "reading killmail log");

    loop {
        let entries = tokio::select! {
            _ = cancel.cancelled() => break,
            entries = log.read_group(GROUP, CONSUMER, 1) => entries,
        };

        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                error!("failed to read stream: {}", err);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_INTERVAL) => continue,
                }
            }
        };

        for entry in &entries {
            match killmail_id(entry) {
                Ok(killmail_id) => {
                    info!(message_id = %entry.id, killmail_id, "received stream message")
                }
                Err(err) => {
                    error!(message_id = %entry.id, "failed to decode stream message: {}", err)
                }
            }
        }
    }

    info!("stopped reading");
    Ok(())
}
