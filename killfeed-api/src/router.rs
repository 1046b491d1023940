use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use killfeed_common::metrics::track_metrics;

use crate::delivery::Delivery;
use crate::endpoints;

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub poll_batch_size: usize,
    pub poll_wait: Duration,
    pub websocket_batch_size: usize,
    pub websocket_wait: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            poll_batch_size: 100,
            poll_wait: Duration::from_secs(60),
            websocket_batch_size: 10,
            websocket_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct State {
    pub delivery: Arc<Delivery>,
    pub settings: DeliverySettings,
    /// Cancelled on shutdown; every push session runs on a child token.
    pub shutdown: CancellationToken,
}

pub fn router(state: State, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(endpoints::index))
        .route("/_healthz", get(endpoints::healthz))
        .route("/version", get(endpoints::version))
        .route("/poll/:queue_id", get(endpoints::poll))
        .route("/websocket/:queue_id", get(endpoints::websocket))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is process-global, tests build the router without one.
    match metrics {
        Some(recorder_handle) => router.route(
            "/metrics",
            get(move || ready(recorder_handle.render())),
        ),
        None => router,
    }
}
