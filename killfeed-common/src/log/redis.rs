use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{
    StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, AsyncConnectionConfig, Client, RedisError};
use async_trait::async_trait;
use deadpool::managed::{self, Metrics, Pool, RecycleError, RecycleResult};
use deadpool::Runtime;
use tracing::warn;

use super::{Entry, EntryId, EventLog, LogError, ReadWait};

// Non-blocking stream commands are fast; anything slower means redis is in trouble.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the connections that serve blocking reads.
struct BlockingConnections {
    client: Client,
}

struct BlockingConnection {
    connection: MultiplexedConnection,
    // Set while an XREAD BLOCK is outstanding. A read dropped halfway leaves
    // the server still blocking on this connection.
    reading: bool,
}

impl managed::Manager for BlockingConnections {
    type Type = BlockingConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<BlockingConnection, RedisError> {
        let config = AsyncConnectionConfig::new().set_connection_timeout(CONNECT_TIMEOUT);
        let connection = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(BlockingConnection {
            connection,
            reading: false,
        })
    }

    async fn recycle(
        &self,
        conn: &mut BlockingConnection,
        _: &Metrics,
    ) -> RecycleResult<RedisError> {
        if conn.reading {
            return Err(RecycleError::Message(
                "connection dropped during a blocking read".into(),
            ));
        }
        Ok(())
    }
}

/// The log as a Redis stream, trimmed with `MAXLEN ~`.
///
/// Short commands share one multiplexed connection. Blocking reads check a
/// connection out of a pool so a long `XREAD BLOCK` never holds up the others.
pub struct RedisStreamLog {
    connection: MultiplexedConnection,
    blocking: Pool<BlockingConnections>,
    key: String,
    max_len: usize,
}

impl RedisStreamLog {
    /// `max_blocking_reads` caps how many blocking reads can be in flight at
    /// once; further readers wait up to the command timeout for a connection.
    pub async fn new(
        url: &str,
        key: &str,
        max_len: usize,
        max_blocking_reads: usize,
    ) -> Result<Self, LogError> {
        let client = Client::open(url)?;
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(COMMAND_TIMEOUT);
        let mut connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        let _pong: String = ::redis::cmd("PING").query_async(&mut connection).await?;

        let blocking = Pool::builder(BlockingConnections { client })
            .max_size(max_blocking_reads.max(1))
            .wait_timeout(Some(COMMAND_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()?;

        Ok(Self {
            connection,
            blocking,
            key: key.to_owned(),
            max_len,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// XREAD on a pooled connection. `deadline` bounds the whole call; a read
    /// that errors or runs past it takes its connection out of the pool.
    async fn blocking_read(
        &self,
        ids: &[&str],
        options: &StreamReadOptions,
        deadline: Option<Duration>,
    ) -> Result<Option<StreamReadReply>, LogError> {
        let mut conn = self.blocking.get().await?;
        conn.reading = true;

        let keys = [self.key.as_str()];
        let read = conn.connection.xread_options(&keys, ids, options);
        let reply: Option<StreamReadReply> = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, read)
                .await
                .map_err(|_| LogError::Timeout)??,
            None => read.await?,
        };

        conn.reading = false;
        Ok(reply)
    }

    /// Create a consumer group reading from new entries only. An existing
    /// group is left alone.
    pub async fn create_group(&self, group: &str) -> Result<(), LogError> {
        let mut conn = self.connection.clone();

        let created: Result<String, RedisError> =
            conn.xgroup_create_mkstream(&self.key, group, "$").await;

        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn create_consumer(&self, group: &str, consumer: &str) -> Result<(), LogError> {
        let mut conn = self.connection.clone();

        let _created: i64 = ::redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(&self.key)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Read entries never delivered to the group, blocking until one arrives.
    /// Entries are not tracked as pending.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Entry>, LogError> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(0)
            .noack();

        let reply = self.blocking_read(&[">"], &options, None).await?;

        reply.map(into_entries).unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl EventLog for RedisStreamLog {
    async fn append(&self, fields: &[(&'static str, String)]) -> Result<EntryId, LogError> {
        let mut conn = self.connection.clone();

        let id: String = conn
            .xadd_maxlen(&self.key, StreamMaxlen::Approx(self.max_len), "*", fields)
            .await?;

        Ok(id.parse()?)
    }

    async fn read(
        &self,
        after: EntryId,
        count: usize,
        wait: ReadWait,
    ) -> Result<Vec<Entry>, LogError> {
        let options = StreamReadOptions::default().count(count);
        let after = after.to_string();

        let reply: Option<StreamReadReply> = match wait {
            ReadWait::Immediate => {
                let mut conn = self.connection.clone();
                conn.xread_options(&[self.key.as_str()], &[after.as_str()], &options)
                    .await?
            }
            ReadWait::Bounded(block) => {
                let millis = usize::try_from(block.as_millis())
                    .unwrap_or(usize::MAX)
                    .max(1);
                self.blocking_read(
                    &[after.as_str()],
                    &options.block(millis),
                    Some(block + COMMAND_TIMEOUT),
                )
                .await?
            }
            ReadWait::Unbounded => {
                self.blocking_read(&[after.as_str()], &options.block(0), None)
                    .await?
            }
        };

        // A nil reply means the block expired with nothing new.
        reply.map(into_entries).unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn tail(&self) -> Result<Option<EntryId>, LogError> {
        let mut conn = self.connection.clone();

        let range: StreamRangeReply = conn.xrevrange_count(&self.key, "+", "-", 1).await?;

        range
            .ids
            .first()
            .map(|newest| newest.id.parse::<EntryId>())
            .transpose()
            .map_err(LogError::from)
    }
}

fn into_entries(reply: StreamReadReply) -> Result<Vec<Entry>, LogError> {
    reply
        .keys
        .into_iter()
        .flat_map(|stream| stream.ids)
        .map(into_entry)
        .collect()
}

fn into_entry(stream_id: StreamId) -> Result<Entry, LogError> {
    let id: EntryId = stream_id.id.parse()?;

    let mut fields = HashMap::with_capacity(stream_id.map.len());
    for (name, value) in stream_id.map {
        match ::redis::from_redis_value::<String>(&value) {
            Ok(value) => {
                fields.insert(name, value);
            }
            // Left out here, decoding the record reports the missing field.
            Err(err) => warn!(
                entry_id = %id,
                field = %name,
                "skipping non-string stream field: {}",
                err
            ),
        }
    }

    Ok(Entry::new(id, fields))
}

// These run against a live redis, see `test_utils::redis_url`.
#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::record::{Record, FIELD_KILLMAIL};
    use crate::test_utils::{append_records, random_string, redis_url};

    async fn test_log(max_len: usize) -> RedisStreamLog {
        RedisStreamLog::new(&redis_url(), &random_string("killmails_", 12), max_len, 4)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn missing_stream_has_no_tail() {
        let log = test_log(1000).await;

        assert_eq!(log.tail().await.unwrap(), None);
        assert!(log
            .read(EntryId::ZERO, 10, ReadWait::Immediate)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reads_entries_after_a_cursor() {
        let log = test_log(1000).await;
        let ids = append_records(&log, &[1, 2, 3]).await;

        assert_eq!(log.tail().await.unwrap(), Some(ids[2]));

        let entries = log.read(ids[0], 10, ReadWait::Immediate).await.unwrap();
        assert_eq!(
            entries.iter().map(|entry| entry.id).collect::<Vec<_>>(),
            ids[1..]
        );
        let record = Record::from_entry(&entries[0]).unwrap();
        assert_eq!(record.killmail.killmail_id, 2);

        let entries = log.read(EntryId::ZERO, 2, ReadWait::Immediate).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, ids[0]);
    }

    #[tokio::test]
    async fn bounded_read_on_an_idle_stream_comes_back_empty() {
        let log = test_log(1000).await;
        let ids = append_records(&log, &[1]).await;

        let started = Instant::now();
        let entries = log
            .read(ids[0], 10, ReadWait::Bounded(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let log = std::sync::Arc::new(test_log(1000).await);
        let ids = append_records(log.as_ref(), &[1]).await;

        let writer = {
            let log = log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                append_records(log.as_ref(), &[2]).await
            })
        };

        let entries = tokio::time::timeout(
            Duration::from_secs(5),
            log.read(ids[0], 10, ReadWait::Unbounded),
        )
        .await
        .expect("blocking read never woke up")
        .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, writer.await.unwrap()[0]);
    }

    #[tokio::test]
    async fn blocking_reads_share_pooled_connections() {
        let log = test_log(1000).await;
        let ids = append_records(&log, &[1]).await;

        for _ in 0..20 {
            log.read(ids[0], 10, ReadWait::Bounded(Duration::from_millis(1)))
                .await
                .unwrap();
        }

        assert_eq!(log.blocking.status().size, 1);
    }

    #[tokio::test]
    async fn abandoned_blocking_read_does_not_poison_the_pool() {
        let log = test_log(1000).await;
        let ids = append_records(&log, &[1]).await;

        // Still blocked server side when dropped.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            log.read(ids[0], 10, ReadWait::Unbounded),
        )
        .await;
        assert!(abandoned.is_err());

        let started = Instant::now();
        let entries = log
            .read(ids[0], 10, ReadWait::Bounded(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() < COMMAND_TIMEOUT);
    }

    #[tokio::test]
    async fn lagging_reader_resumes_at_the_oldest_surviving_entry() {
        // MAXLEN ~ only drops whole stream nodes, 100 entries by default.
        let log = test_log(10).await;
        let ids = append_records(&log, &(1..=250).collect::<Vec<_>>()).await;

        let entries = log.read(EntryId::ZERO, 1000, ReadWait::Immediate).await.unwrap();

        assert!(entries.len() < ids.len());
        let first = ids
            .iter()
            .position(|id| *id == entries[0].id)
            .expect("oldest entry was never appended");
        assert!(first > 0);
        assert_eq!(
            entries.iter().map(|entry| entry.id).collect::<Vec<_>>(),
            ids[first..]
        );
    }

    #[tokio::test]
    async fn consumer_group_reads_only_new_entries() {
        let log = test_log(1000).await;
        let group = random_string("group_", 8);
        append_records(&log, &[1]).await;

        log.create_group(&group).await.unwrap();
        log.create_group(&group).await.unwrap();
        log.create_consumer(&group, "any").await.unwrap();

        let ids = append_records(&log, &[2]).await;
        let entries = tokio::time::timeout(
            Duration::from_secs(5),
            log.read_group(&group, "any", 10),
        )
        .await
        .expect("group read never returned")
        .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, ids[0]);
    }

    #[test]
    fn non_string_fields_are_skipped() {
        let stream_id = StreamId {
            id: "1714566600000-0".to_owned(),
            map: HashMap::from([
                (
                    FIELD_KILLMAIL.to_owned(),
                    ::redis::Value::BulkString(b"{}".to_vec()),
                ),
                ("count".to_owned(), ::redis::Value::Array(vec![])),
            ]),
        };

        let entry = into_entry(stream_id).unwrap();

        assert_eq!(entry.id, EntryId::new(1714566600000, 0));
        assert_eq!(entry.field(FIELD_KILLMAIL), Some("{}"));
        assert_eq!(entry.field("count"), None);

        let bad = StreamId {
            id: "not-an-id".to_owned(),
            map: HashMap::new(),
        };
        assert!(matches!(into_entry(bad), Err(LogError::InvalidEntryId(_))));
    }
}
