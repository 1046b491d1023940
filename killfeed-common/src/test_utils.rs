//! Fixtures shared by the test suites of the killfeed crates.

use ::redis::{ErrorKind, RedisError};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};

use crate::log::{Entry, EntryId, EventLog, LogError, ReadWait};
use crate::record::{Attacker, Killmail, Record, Victim, ZkbMetadata};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Redis for the live-server tests. Honours `REDIS_URL`.
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/".to_string())
}

pub fn killmail(killmail_id: i64) -> Killmail {
    Killmail {
        killmail_id,
        killmail_time: "2024-05-01T12:30:00Z"
            .parse()
            .expect("fixture timestamp is valid"),
        solar_system_id: 30000142,
        moon_id: None,
        war_id: None,
        victim: Victim {
            character_id: Some(90000001),
            corporation_id: Some(98000001),
            alliance_id: None,
            faction_id: None,
            damage_taken: 1520,
            ship_type_id: 587,
            position: None,
            items: Vec::new(),
        },
        attackers: vec![Attacker {
            character_id: Some(90000002),
            corporation_id: Some(98000002),
            alliance_id: None,
            faction_id: None,
            damage_done: 1520,
            final_blow: true,
            security_status: -2.5,
            ship_type_id: Some(11198),
            weapon_type_id: Some(2881),
        }],
    }
}

pub fn zkb(hash: &str) -> ZkbMetadata {
    ZkbMetadata {
        hash: hash.to_owned(),
        total_value: 12_500_000.0,
        points: 1,
        solo: true,
        ..Default::default()
    }
}

pub fn record(killmail_id: i64) -> Record {
    Record::new(killmail(killmail_id), zkb(&format!("hash{killmail_id}")))
}

/// Append one record per id, returning the entry ids in order.
pub async fn append_records(log: &dyn EventLog, killmail_ids: &[i64]) -> Vec<EntryId> {
    let mut ids = Vec::with_capacity(killmail_ids.len());
    for killmail_id in killmail_ids {
        let fields = record(*killmail_id)
            .to_fields()
            .expect("fixture record encodes");
        ids.push(log.append(&fields).await.expect("append to test log"));
    }
    ids
}

/// A log whose storage is always unreachable.
pub struct UnavailableLog;

#[async_trait]
impl EventLog for UnavailableLog {
    async fn append(&self, _fields: &[(&'static str, String)]) -> Result<EntryId, LogError> {
        Err(storage_unreachable())
    }

    async fn read(
        &self,
        _after: EntryId,
        _count: usize,
        _wait: ReadWait,
    ) -> Result<Vec<Entry>, LogError> {
        Err(storage_unreachable())
    }

    async fn tail(&self) -> Result<Option<EntryId>, LogError> {
        Err(storage_unreachable())
    }
}

fn storage_unreachable() -> LogError {
    LogError::Storage(RedisError::from((ErrorKind::IoError, "connection refused")))
}
