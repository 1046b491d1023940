use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Entry, EntryId, EventLog, LogError, ReadWait};

/// In-process log with the same semantics as the Redis stream.
///
/// Identifiers are `n-0` with `n` counting from 1. Trimming is lazy: once the
/// log holds more than `max_len` plus a slack of a tenth of the bound, the
/// oldest entries are dropped down to `max_len`.
pub struct MemoryLog {
    max_len: usize,
    slack: usize,
    state: Mutex<State>,
    appended: watch::Sender<EntryId>,
}

struct State {
    next: u64,
    entries: VecDeque<Entry>,
}

impl MemoryLog {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        let (appended, _) = watch::channel(EntryId::ZERO);

        Self {
            max_len,
            slack: (max_len / 10).max(1),
            state: Mutex::new(State {
                next: 1,
                entries: VecDeque::new(),
            }),
            appended,
        }
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest retained identifier.
    pub fn horizon(&self) -> Option<EntryId> {
        self.lock().entries.front().map(|entry| entry.id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn collect(&self, after: EntryId, count: usize) -> Vec<Entry> {
        let state = self.lock();
        let start = state.entries.partition_point(|entry| entry.id <= after);

        state
            .entries
            .range(start..)
            .take(count)
            .cloned()
            .collect()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, fields: &[(&'static str, String)]) -> Result<EntryId, LogError> {
        let id = {
            let mut state = self.lock();
            let id = EntryId::new(state.next, 0);
            state.next += 1;

            let fields = fields
                .iter()
                .map(|(name, value)| ((*name).to_owned(), value.clone()))
                .collect();
            state.entries.push_back(Entry::new(id, fields));

            if state.entries.len() > self.max_len + self.slack {
                let excess = state.entries.len() - self.max_len;
                state.entries.drain(..excess);
            }

            id
        };

        self.appended.send_replace(id);

        Ok(id)
    }

    async fn read(
        &self,
        after: EntryId,
        count: usize,
        wait: ReadWait,
    ) -> Result<Vec<Entry>, LogError> {
        // Subscribe before looking so an append racing with the check still wakes us.
        let mut appended = self.appended.subscribe();

        let entries = self.collect(after, count);
        if !entries.is_empty() {
            return Ok(entries);
        }

        let deadline = match wait {
            ReadWait::Immediate => return Ok(entries),
            ReadWait::Bounded(wait) => Some(tokio::time::Instant::now() + wait),
            ReadWait::Unbounded => None,
        };

        loop {
            let changed = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, appended.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => return Ok(Vec::new()),
                    }
                }
                None => appended.changed().await,
            };

            // Closed only once the log itself is gone.
            if changed.is_err() {
                return Ok(Vec::new());
            }

            let entries = self.collect(after, count);
            if !entries.is_empty() {
                return Ok(entries);
            }
        }
    }

    async fn tail(&self) -> Result<Option<EntryId>, LogError> {
        Ok(self.lock().entries.back().map(|entry| entry.id))
    }
}
