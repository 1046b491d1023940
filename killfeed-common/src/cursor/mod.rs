//! Per-consumer read positions.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::log::{EntryId, ParseEntryIdError};

mod memory;
mod redis;

pub use self::memory::MemoryCursorStore;
pub use self::redis::RedisCursorStore;

/// Cursors live this long after their last use.
pub const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Delivery modes keep separate cursors, even for the same consumer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    Poll,
    Websocket,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Poll => "poll",
            DeliveryMode::Websocket => "websocket",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage key of the cursor for `consumer_key` under `mode`.
pub fn cursor_key(mode: DeliveryMode, consumer_key: &str) -> String {
    format!("stream:{}:{}", mode, consumer_key)
}

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("cursor storage error: {0}")]
    Storage(#[from] ::redis::RedisError),
    #[error("stored cursor {key} is not a valid entry id")]
    Corrupt {
        key: String,
        #[source]
        source: ParseEntryIdError,
    },
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last entry delivered to the consumer, `None` when it has no history.
    async fn get(&self, mode: DeliveryMode, key: &str) -> Result<Option<EntryId>, CursorError>;

    /// Store `id` as the consumer position and refresh its TTL.
    /// A stored position is never moved backwards.
    async fn set(
        &self,
        mode: DeliveryMode,
        key: &str,
        id: EntryId,
        ttl: Duration,
    ) -> Result<(), CursorError>;
}
