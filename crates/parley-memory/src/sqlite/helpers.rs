use chrono::{DateTime, Utc};
use parley_core::{
    ChatDirection, ChatLogEntry, ContentPart, ConversationKey, MessageRecord, RecordId,
    RecordKind, RunId,
};
use rusqlite::Row;
use rusqlite::types::Type;
use std::collections::HashMap;
use uuid::Uuid;

/// Column list matching [`record_from_row`].
pub(super) const RECORD_COLUMNS: &str =
    "id, conversation, actor_id, kind, parts, metadata, run_id, timestamp";

pub(super) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id: String = row.get(0)?;
    let conversation: String = row.get(1)?;
    let kind: String = row.get(3)?;
    let parts: String = row.get(4)?;
    let metadata: String = row.get(5)?;

    Ok(MessageRecord {
        id: RecordId::from_uuid(Uuid::parse_str(&id).map_err(|e| conversion(0, e.into()))?),
        conversation: parse_key(1, &conversation)?,
        actor_id: row.get(2)?,
        kind: kind
            .parse::<RecordKind>()
            .map_err(|e| conversion(3, e.into()))?,
        parts: serde_json::from_str::<Vec<ContentPart>>(&parts)
            .map_err(|e| conversion(4, e.into()))?,
        metadata: serde_json::from_str::<HashMap<String, String>>(&metadata)
            .map_err(|e| conversion(5, e.into()))?,
        run_id: row.get::<_, Option<String>>(6)?.map(RunId::new),
        timestamp: dt_from_micros(7, row.get(7)?)?,
    })
}

pub(super) fn chat_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ChatLogEntry> {
    let conversation: String = row.get(0)?;
    let direction: String = row.get(2)?;
    let direction = match direction.as_str() {
        "inbound" => ChatDirection::Inbound,
        "outbound" => ChatDirection::Outbound,
        other => {
            return Err(conversion(
                2,
                format!("unknown chat direction: {other}").into(),
            ));
        }
    };

    Ok(ChatLogEntry {
        conversation: parse_key(0, &conversation)?,
        actor_id: row.get(1)?,
        direction,
        content: row.get(3)?,
        timestamp: dt_from_micros(4, row.get(4)?)?,
    })
}

fn parse_key(idx: usize, raw: &str) -> rusqlite::Result<ConversationKey> {
    raw.parse::<ConversationKey>()
        .map_err(|e| conversion(idx, e.into()))
}

fn conversion(idx: usize, error: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, error)
}

pub(super) fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

pub(super) fn micros_from_dt(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

/// Column `idx` holds microseconds since the epoch.
pub(super) fn dt_from_micros(idx: usize, us: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {us}").into(),
        )
    })
}

pub(super) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
