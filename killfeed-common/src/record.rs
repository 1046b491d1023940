use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::{Entry, EntryId};

/// Stream field holding the ESI killmail JSON.
pub const FIELD_KILLMAIL: &str = "killmail";
/// Stream field holding the zKillboard metadata JSON.
pub const FIELD_ZKB: &str = "killmail_zkb";

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Metadata attached by zKillboard to every killmail it publishes.
/// `hash` is the token required to fetch the full killmail from ESI.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ZkbMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(rename = "locationID", skip_serializing_if = "is_zero_i64")]
    pub location_id: i64,
    #[serde(rename = "fittedValue", skip_serializing_if = "is_zero_f64")]
    pub fitted_value: f64,
    #[serde(rename = "droppedValue", skip_serializing_if = "is_zero_f64")]
    pub dropped_value: f64,
    #[serde(rename = "destroyedValue", skip_serializing_if = "is_zero_f64")]
    pub destroyed_value: f64,
    #[serde(rename = "totalValue", skip_serializing_if = "is_zero_f64")]
    pub total_value: f64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub points: i64,
    #[serde(skip_serializing_if = "is_false")]
    pub npc: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub solo: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub awox: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub href: String,
}

/// One package handed out by the RedisQ feed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(rename = "killID")]
    pub killmail_id: i64,
    pub zkb: ZkbMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Item {
    pub item_type_id: i64,
    pub flag: i64,
    pub singleton: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_destroyed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_dropped: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Victim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<i64>,
    pub damage_taken: i64,
    pub ship_type_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Attacker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<i64>,
    pub damage_done: i64,
    pub final_blow: bool,
    pub security_status: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weapon_type_id: Option<i64>,
}

/// Full killmail as returned by ESI.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Killmail {
    pub killmail_id: i64,
    pub killmail_time: DateTime<Utc>,
    pub solar_system_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moon_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub war_id: Option<i64>,
    pub victim: Victim,
    #[serde(default)]
    pub attackers: Vec<Attacker>,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("failed to encode record field {field}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid killmail message {id}, missing {field} field")]
    MissingField { id: EntryId, field: &'static str },
    #[error("failed to decode killmail message {id} {field} field")]
    Decode {
        id: EntryId,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// An enriched killmail: the ESI payload with the zKillboard metadata alongside.
///
/// Serializes to the public shape consumers receive: killmail fields at the
/// top level and the metadata under `zkb`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Record {
    #[serde(flatten)]
    pub killmail: Killmail,
    pub zkb: ZkbMetadata,
}

impl Record {
    pub fn new(killmail: Killmail, zkb: ZkbMetadata) -> Self {
        Self { killmail, zkb }
    }

    /// Encode into the stream fields stored in the log.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, RecordError> {
        let killmail =
            serde_json::to_string(&self.killmail).map_err(|source| RecordError::Encode {
                field: FIELD_KILLMAIL,
                source,
            })?;
        let zkb = serde_json::to_string(&self.zkb).map_err(|source| RecordError::Encode {
            field: FIELD_ZKB,
            source,
        })?;

        Ok(vec![(FIELD_KILLMAIL, killmail), (FIELD_ZKB, zkb)])
    }

    /// Decode a log entry back into a Record.
    pub fn from_entry(entry: &Entry) -> Result<Record, RecordError> {
        let killmail: Killmail = decode_field(entry, FIELD_KILLMAIL)?;
        let zkb: ZkbMetadata = decode_field(entry, FIELD_ZKB)?;

        Ok(Record { killmail, zkb })
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(
    entry: &Entry,
    field: &'static str,
) -> Result<T, RecordError> {
    let raw = entry.field(field).ok_or(RecordError::MissingField {
        id: entry.id,
        field,
    })?;

    serde_json::from_str(raw).map_err(|source| RecordError::Decode {
        id: entry.id,
        field,
        source,
    })
}
