use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{cursor_key, CursorError, CursorStore, DeliveryMode};
use crate::log::EntryId;

/// Cursor store kept in process memory, expiring entries lazily on access.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, (EntryId, Instant)>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (EntryId, Instant)>> {
        match self.cursors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, mode: DeliveryMode, key: &str) -> Result<Option<EntryId>, CursorError> {
        let key = cursor_key(mode, key);
        let mut cursors = self.lock();

        match cursors.get(&key) {
            Some((id, expires_at)) if *expires_at > Instant::now() => Ok(Some(*id)),
            Some(_) => {
                cursors.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        mode: DeliveryMode,
        key: &str,
        id: EntryId,
        ttl: Duration,
    ) -> Result<(), CursorError> {
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut cursors = self.lock();

        let stored = cursors
            .entry(cursor_key(mode, key))
            .or_insert((id, expires_at));

        // An expired cursor is gone, it does not hold the position back.
        if stored.1 <= now || stored.0 < id {
            stored.0 = id;
        }
        stored.1 = expires_at;

        Ok(())
    }
}
