//! Reading the killmail log on behalf of a consumer.
//!
//! Both delivery modes follow the same protocol: resolve the consumer cursor,
//! read the entries after it, hand them out and only then move the cursor to
//! the last entry handed out. A crash between the last two steps re-delivers
//! the batch, so consumers see every entry at least once.

use std::sync::Arc;
use std::time::Duration;

use killfeed_common::cursor::{CursorError, CursorStore, DeliveryMode};
use killfeed_common::log::{EntryId, EventLog, LogError, ReadWait};
use killfeed_common::record::{Record, RecordError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to read the killmail log: {0}")]
    Log(#[from] LogError),
    #[error("failed to access the consumer cursor: {0}")]
    Cursor(#[from] CursorError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("failed to encode killmail: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decoded records of one read, with the id to commit once they are delivered.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    pub last: Option<EntryId>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct Delivery {
    log: Arc<dyn EventLog>,
    cursors: Arc<dyn CursorStore>,
    cursor_ttl: Duration,
}

impl Delivery {
    pub fn new(log: Arc<dyn EventLog>, cursors: Arc<dyn CursorStore>, cursor_ttl: Duration) -> Self {
        Self {
            log,
            cursors,
            cursor_ttl,
        }
    }

    /// Position of `key`. A consumer without history starts at the current
    /// tail, which is stored right away so the next read picks up from there.
    pub async fn resolve_cursor(
        &self,
        mode: DeliveryMode,
        key: &str,
    ) -> Result<EntryId, DeliveryError> {
        if let Some(cursor) = self.cursors.get(mode, key).await? {
            return Ok(cursor);
        }

        let tail = self.log.tail().await?.unwrap_or(EntryId::ZERO);
        self.cursors.set(mode, key, tail, self.cursor_ttl).await?;
        debug!(%mode, key, cursor = %tail, "new consumer starts at the tail");

        Ok(tail)
    }

    /// Read and decode up to `count` entries after the consumer cursor.
    /// The cursor is left where it is, see [`Delivery::commit`].
    pub async fn next_batch(
        &self,
        mode: DeliveryMode,
        key: &str,
        count: usize,
        wait: ReadWait,
    ) -> Result<Batch, DeliveryError> {
        let cursor = self.resolve_cursor(mode, key).await?;
        let entries = self.log.read(cursor, count, wait).await?;

        let mut batch = Batch {
            records: Vec::with_capacity(entries.len()),
            last: None,
        };
        for entry in &entries {
            batch.records.push(Record::from_entry(entry)?);
            batch.last = Some(entry.id);
        }

        Ok(batch)
    }

    /// Move the consumer cursor to `last` and refresh its TTL.
    pub async fn commit(
        &self,
        mode: DeliveryMode,
        key: &str,
        last: EntryId,
    ) -> Result<(), DeliveryError> {
        self.cursors.set(mode, key, last, self.cursor_ttl).await?;
        Ok(())
    }

    /// One pull: the next batch for `key`, committed before it is returned.
    /// An empty batch leaves the cursor untouched. `cancel` ends the wait with
    /// an empty batch; once a batch is read it is always committed.
    pub async fn pull(
        &self,
        key: &str,
        count: usize,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, DeliveryError> {
        let batch = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            batch = self.next_batch(DeliveryMode::Poll, key, count, wait.into()) => batch?,
        };

        if let Some(last) = batch.last {
            self.commit(DeliveryMode::Poll, key, last).await?;
            metrics::counter!("killfeed_delivered_records_total", "mode" => "poll")
                .increment(batch.records.len() as u64);
        }

        Ok(batch.records)
    }
}
