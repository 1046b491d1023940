use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, AsyncConnectionConfig, Client, Script};
use async_trait::async_trait;

use super::{cursor_key, CursorError, CursorStore, DeliveryMode};
use crate::log::EntryId;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// KEYS[1] = cursor key, ARGV[1] = entry id, ARGV[2] = ttl in seconds.
// Keeps the larger of the stored and the new id, refreshing the TTL either way.
const ADVANCE_CURSOR: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  local cms, cseq = string.match(current, '^(%d+)-(%d+)$')
  local nms, nseq = string.match(ARGV[1], '^(%d+)-(%d+)$')
  if cms and nms then
    cms, cseq, nms, nseq = tonumber(cms), tonumber(cseq), tonumber(nms), tonumber(nseq)
    if cms > nms or (cms == nms and cseq > nseq) then
      redis.call('EXPIRE', KEYS[1], ARGV[2])
      return 0
    end
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return 1
";

/// Cursors as plain Redis string keys with a TTL.
pub struct RedisCursorStore {
    connection: MultiplexedConnection,
    advance: Script,
}

impl RedisCursorStore {
    pub async fn new(url: &str) -> Result<Self, CursorError> {
        let client = Client::open(url)?;
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(COMMAND_TIMEOUT);
        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(Self {
            connection,
            advance: Script::new(ADVANCE_CURSOR),
        })
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn get(&self, mode: DeliveryMode, key: &str) -> Result<Option<EntryId>, CursorError> {
        let key = cursor_key(mode, key);
        let mut conn = self.connection.clone();

        let stored: Option<String> = conn.get(&key).await?;

        stored
            .map(|value| {
                value
                    .parse::<EntryId>()
                    .map_err(|source| CursorError::Corrupt { key, source })
            })
            .transpose()
    }

    async fn set(
        &self,
        mode: DeliveryMode,
        key: &str,
        id: EntryId,
        ttl: Duration,
    ) -> Result<(), CursorError> {
        let mut conn = self.connection.clone();

        let _advanced: i64 = self
            .advance
            .key(cursor_key(mode, key))
            .arg(id.to_string())
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }
}
