//! Follow the zKillboard RedisQ feed, enrich each killmail from ESI and
//! append it to the shared killmail log.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use killfeed_common::health::HealthRegistry;
use killfeed_common::log::RedisStreamLog;
use killfeed_common::metrics::{serve, setup_metrics_router};
use killfeed_common::{logging, shutdown};
use killfeed_poller::config::Config;
use killfeed_poller::enrichment::EsiClient;
use killfeed_poller::feed::RedisQFeed;
use killfeed_poller::ingest::{IngestSettings, Ingester};

/// Slack on top of one full feed round trip before the loop counts as stalled.
const LIVENESS_SLACK: Duration = Duration::from_secs(30);

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

    let feed = RedisQFeed::new(
        &config.redisq_url,
        config.queue_id.as_str(),
        config.feed_timeout_ms.0,
    )
    .context("failed to build RedisQ client")?;

    let esi = EsiClient::new(
        &config.esi_url,
        config.esi_contact_information.as_str(),
        config.esi_timeout_ms.0,
    )
    .context("failed to build ESI client")?;

    let registry = HealthRegistry::new();
    let liveness = registry.register(
        "ingestion",
        config.feed_timeout_ms.0 + config.feed_backoff_ms.0 + LIVENESS_SLACK,
    );

    let ingester = Ingester::new(
        Arc::new(feed),
        Arc::new(esi),
        Arc::new(log),
        IngestSettings {
            dedup_capacity: config.dedup_capacity,
            max_concurrent_enrichments: config.max_concurrent_enrichments,
            feed_backoff: config.feed_backoff_ms.0,
            drain_timeout: config.enrichment_drain_timeout_ms.0,
        },
        liveness,
    );

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let router = Router::new()
        .route("/_healthz", get(move || ready(registry.get_status())))
        .merge(setup_metrics_router().context("failed to install metrics recorder")?);

    let bind = config.bind();
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            serve(router, &bind, async move { cancel.cancelled().await }).await
        })
    };

    tracing::info!(
        queue_id = config.queue_id.as_str(),
        stream_key = config.stream.stream_key.as_str(),
        "starting poller"
    );
    ingester.run(cancel.clone()).await;

    cancel.cancel();
    server
        .await
        .context("metrics server panicked")?
        .context("failed to serve metrics")?;

    Ok(())
}
