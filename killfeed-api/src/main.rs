//! Serve the killmail log to pull and push consumers.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use killfeed_api::config::Config;
use killfeed_api::delivery::Delivery;
use killfeed_api::router::{self, DeliverySettings};
use killfeed_common::cursor::RedisCursorStore;
use killfeed_common::log::RedisStreamLog;
use killfeed_common::metrics::setup_metrics_recorder;
use killfeed_common::{logging, shutdown};

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

    let cursors = RedisCursorStore::new(config.stream.redis_url.as_str())
        .await
        .context("failed to connect to the cursor store")?;

    let delivery = Delivery::new(
        Arc::new(log),
        Arc::new(cursors),
        Duration::from_secs(config.cursor_ttl_secs),
    );

    let metrics = match config.export_prometheus {
        true => Some(setup_metrics_recorder().context("failed to install metrics recorder")?),
        false => None,
    };

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let state = router::State {
        delivery: Arc::new(delivery),
        settings: DeliverySettings {
            poll_batch_size: config.poll_batch_size,
            poll_wait: config.poll_wait_ms.0,
            websocket_batch_size: config.websocket_batch_size,
            websocket_wait: config.websocket_wait_ms.0,
        },
        shutdown: cancel.clone(),
    };
    let app = router::router(state, metrics);

    let address = config.address().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context("could not bind port")?;

    tracing::info!(%address, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server failed")?;

    Ok(())
}
