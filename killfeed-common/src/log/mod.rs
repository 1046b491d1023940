//! The shared, append-only killmail log.
//!
//! Every producer appends to one logical log and every consumer reads from it
//! with its own position. Entries are addressed by strictly increasing
//! [`EntryId`]s and the oldest entries are trimmed once the log grows past an
//! approximate bound: a reader positioned before the trim horizon simply
//! resumes at the oldest surviving entry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryLog;
pub use self::redis::RedisStreamLog;

/// Identifier of a log entry, rendered as `{ms}-{seq}` like a Redis stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// The position before any entry.
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid entry id: {0:?}")]
pub struct ParseEntryIdError(String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_owned());

        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, Some(seq)),
            None => (s, None),
        };

        let ms = ms.parse::<u64>().map_err(|_| invalid())?;
        let seq = match seq {
            Some(seq) => seq.parse::<u64>().map_err(|_| invalid())?,
            None => 0,
        };

        Ok(EntryId { ms, seq })
    }
}

/// One stored record with its identifier. Fields hold the encoded record
/// (see [`crate::record::Record::to_fields`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    fields: HashMap<String, String>,
}

impl Entry {
    pub fn new(id: EntryId, fields: HashMap<String, String>) -> Self {
        Self { id, fields }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// How long a read may suspend when no entry is available yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWait {
    /// Return straight away, possibly with nothing.
    Immediate,
    /// Suspend up to the given duration for the first entry.
    Bounded(Duration),
    /// Suspend until an entry arrives or the caller drops the future.
    Unbounded,
}

impl From<Duration> for ReadWait {
    fn from(wait: Duration) -> Self {
        if wait.is_zero() {
            ReadWait::Immediate
        } else {
            ReadWait::Bounded(wait)
        }
    }
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("event log storage error: {0}")]
    Storage(#[from] ::redis::RedisError),
    #[error("timed out waiting for the event log")]
    Timeout,
    #[error("no event log connection available: {0}")]
    Pool(#[from] deadpool::managed::PoolError<::redis::RedisError>),
    #[error("failed to build the event log connection pool: {0}")]
    PoolSetup(#[from] deadpool::managed::BuildError),
    #[error("event log returned an invalid entry id")]
    InvalidEntryId(#[from] ParseEntryIdError),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one record and return the identifier assigned to it.
    /// Trims the oldest entries once the log exceeds its bound.
    async fn append(&self, fields: &[(&'static str, String)]) -> Result<EntryId, LogError>;

    /// Read up to `count` entries with an identifier strictly greater than
    /// `after`, oldest first.
    async fn read(
        &self,
        after: EntryId,
        count: usize,
        wait: ReadWait,
    ) -> Result<Vec<Entry>, LogError>;

    /// Identifier of the newest entry, `None` while the log is empty.
    async fn tail(&self) -> Result<Option<EntryId>, LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_parses_and_renders() {
        let id: EntryId = "1714566600000-3".parse().unwrap();
        assert_eq!(id, EntryId::new(1714566600000, 3));
        assert_eq!(id.to_string(), "1714566600000-3");

        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::new(42, 0));
        assert!("".parse::<EntryId>().is_err());
        assert!("1-".parse::<EntryId>().is_err());
        assert!("$".parse::<EntryId>().is_err());
        assert!("-1-0".parse::<EntryId>().is_err());
    }

    #[test]
    fn entry_ids_order_by_time_then_sequence() {
        assert!(EntryId::new(1, 9) < EntryId::new(2, 0));
        assert!(EntryId::new(2, 0) < EntryId::new(2, 1));
        assert!(EntryId::ZERO < EntryId::new(0, 1));
    }

    #[test]
    fn zero_wait_is_immediate() {
        assert_eq!(ReadWait::from(Duration::ZERO), ReadWait::Immediate);
        assert_eq!(
            ReadWait::from(Duration::from_secs(60)),
            ReadWait::Bounded(Duration::from_secs(60))
        );
    }
}
