use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use killfeed_common::record::Record;
use tracing::{info, Instrument};

use crate::api::{validate_queue_id, ApiError};
use crate::router;
use crate::session::PushSession;

pub async fn index() -> Html<&'static str> {
    Html("<html><body>Hello</body></html>")
}

pub async fn version() -> &'static str {
    killfeed_common::VERSION
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Everything logged after the consumer cursor, up to the batch size. Held
/// open until the first new killmail arrives, the poll wait runs out or the
/// server shuts down.
pub async fn poll(
    State(state): State<router::State>,
    Path(queue_id): Path<String>,
) -> Result<Json<Vec<Record>>, ApiError> {
    validate_queue_id(&queue_id)?;

    let records = state
        .delivery
        .pull(
            &queue_id,
            state.settings.poll_batch_size,
            state.settings.poll_wait,
            &state.shutdown,
        )
        .instrument(tracing::info_span!("poll", queue_id = %queue_id))
        .await?;

    Ok(Json(records))
}

/// Upgrade to a push session. The queue id is checked before the upgrade.
pub async fn websocket(
    State(state): State<router::State>,
    Path(queue_id): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    validate_queue_id(&queue_id)?;

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let span = tracing::info_span!("websocket", queue_id = %queue_id);
    Ok(upgrade
        .on_upgrade(move |socket| handle_socket(state, queue_id, socket).instrument(span))
        .into_response())
}

async fn handle_socket(state: router::State, queue_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let cancel = state.shutdown.child_token();

    // Inbound messages are ignored; the stream only tells us when the client leaves.
    let reader = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            cancel.cancel();
        })
    };

    info!("new websocket connection");
    metrics::gauge!("killfeed_websocket_sessions").increment(1.0);

    let session = PushSession::new(
        state.delivery.clone(),
        queue_id,
        state.settings.websocket_batch_size,
        state.settings.websocket_wait,
    );
    let end = session.run(&mut sink, cancel.clone()).await;

    cancel.cancel();
    reader.abort();

    metrics::gauge!("killfeed_websocket_sessions").decrement(1.0);
    info!(?end, "closed websocket connection");
}
