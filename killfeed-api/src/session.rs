use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use killfeed_common::cursor::DeliveryMode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::delivery::{Delivery, DeliveryError};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
// 1006 is reserved for the receiving side and never goes on the wire.
pub const CLOSE_WRITE_FAILED: u16 = 4000;

/// Outbound half of a push connection.
#[async_trait]
pub trait SessionSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), axum::Error>;

    async fn close(&mut self, code: u16, reason: &'static str) -> Result<(), axum::Error>;
}

#[async_trait]
impl SessionSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), axum::Error> {
        self.send(Message::Text(text)).await
    }

    async fn close(&mut self, code: u16, reason: &'static str) -> Result<(), axum::Error> {
        self.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client went away or the server is shutting down.
    Cancelled,
    InternalError,
    WriteFailed,
}

impl SessionEnd {
    pub fn close_code(&self) -> u16 {
        match self {
            SessionEnd::Cancelled => CLOSE_NORMAL,
            SessionEnd::InternalError => CLOSE_INTERNAL_ERROR,
            SessionEnd::WriteFailed => CLOSE_WRITE_FAILED,
        }
    }

    fn close_reason(&self) -> &'static str {
        match self {
            SessionEnd::Cancelled => "closing",
            SessionEnd::InternalError => "internal server error",
            SessionEnd::WriteFailed => "write failed",
        }
    }
}

/// Forwards new log entries to one push connection, one message per record.
pub struct PushSession {
    delivery: Arc<Delivery>,
    queue_id: String,
    batch_size: usize,
    wait: Duration,
}

impl PushSession {
    pub fn new(delivery: Arc<Delivery>, queue_id: String, batch_size: usize, wait: Duration) -> Self {
        Self {
            delivery,
            queue_id,
            batch_size,
            wait,
        }
    }

    /// Run until `cancel` fires or the session fails, then close the sink
    /// with the matching close code.
    pub async fn run<S: SessionSink>(&self, sink: &mut S, cancel: CancellationToken) -> SessionEnd {
        let end = self.forward(sink, &cancel).await;

        if let Err(err) = sink.close(end.close_code(), end.close_reason()).await {
            debug!("failed to close websocket: {}", err);
        }

        end
    }

    async fn forward<S: SessionSink>(&self, sink: &mut S, cancel: &CancellationToken) -> SessionEnd {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                batch = self.delivery.next_batch(
                    DeliveryMode::Websocket,
                    &self.queue_id,
                    self.batch_size,
                    self.wait.into(),
                ) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    error!("failed to fetch websocket killmails: {}", err);
                    return SessionEnd::InternalError;
                }
            };

            let Some(last) = batch.last else {
                continue;
            };

            for record in &batch.records {
                let payload = match serde_json::to_string(record) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!("{}", DeliveryError::from(err));
                        return SessionEnd::InternalError;
                    }
                };

                if let Err(err) = sink.send_text(payload).await {
                    error!("failed to write to websocket: {}", err);
                    return SessionEnd::WriteFailed;
                }
            }

            if let Err(err) = self
                .delivery
                .commit(DeliveryMode::Websocket, &self.queue_id, last)
                .await
            {
                error!("failed to store websocket cursor: {}", err);
                return SessionEnd::InternalError;
            }

            metrics::counter!("killfeed_delivered_records_total", "mode" => "websocket")
                .increment(batch.records.len() as u64);
        }
    }
}
