use anyhow::Result;
use chrono::{DateTime, Utc};
use parley_core::{ChatLogEntry, ConversationKey, MessageRecord, RunId, RunSummary};
use rusqlite::params;
use tracing::{debug, warn};

use super::{SqliteStore, helpers};

pub(super) fn run_ids(
    store: &SqliteStore,
    conversation: &ConversationKey,
    limit: usize,
) -> Result<Vec<RunSummary>> {
    let conn = store.conn.lock().expect("turn store mutex poisoned");
    let mut stmt = conn.prepare(
        "
        SELECT run_id, MIN(timestamp), MAX(timestamp)
        FROM model_records
        WHERE conversation = ?
          AND run_id IS NOT NULL
        GROUP BY run_id
        ORDER BY MAX(timestamp) DESC, run_id ASC
        LIMIT ?
        ",
    )?;

    let runs = stmt
        .query_map(
            params![conversation.to_string(), helpers::sql_limit(limit)],
            |row| {
                Ok(RunSummary {
                    run_id: RunId::new(row.get::<_, String>(0)?),
                    first_seen: helpers::dt_from_micros(1, row.get(1)?)?,
                    last_seen: helpers::dt_from_micros(2, row.get(2)?)?,
                })
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);

    debug!(runs = runs.len(), limit, "run ids queried");
    Ok(runs)
}

pub(super) fn time_window(
    store: &SqliteStore,
    conversation: &ConversationKey,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<MessageRecord>> {
    let conn = store.conn.lock().expect("turn store mutex poisoned");
    let sql = format!(
        "
        SELECT {}
        FROM model_records
        WHERE conversation = ?
          AND timestamp BETWEEN ? AND ?
        ORDER BY timestamp ASC, id ASC
        ",
        helpers::RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let records = stmt
        .query_map(
            params![
                conversation.to_string(),
                helpers::micros_from_dt(start),
                helpers::micros_from_dt(end)
            ],
            helpers::record_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);

    debug!(records = records.len(), "time window queried");
    Ok(records)
}

pub(super) fn conversations(store: &SqliteStore) -> Result<Vec<ConversationKey>> {
    let conn = store.conn.lock().expect("turn store mutex poisoned");
    let mut stmt =
        conn.prepare("SELECT DISTINCT conversation FROM model_records ORDER BY conversation")?;
    let raw = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);

    let mut keys = Vec::with_capacity(raw.len());
    for value in raw {
        match value.parse::<ConversationKey>() {
            Ok(key) => keys.push(key),
            Err(error) => warn!(value, error = %error, "skipping malformed conversation key"),
        }
    }
    Ok(keys)
}

pub(super) fn chat_window(
    store: &SqliteStore,
    conversation: &ConversationKey,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ChatLogEntry>> {
    let conn = store.conn.lock().expect("turn store mutex poisoned");
    let mut stmt = conn.prepare(
        "
        SELECT conversation, actor_id, direction, content, timestamp
        FROM chat_log
        WHERE conversation = ?
          AND timestamp BETWEEN ? AND ?
        ORDER BY timestamp ASC, id ASC
        ",
    )?;

    let entries = stmt
        .query_map(
            params![
                conversation.to_string(),
                helpers::micros_from_dt(start),
                helpers::micros_from_dt(end)
            ],
            helpers::chat_entry_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);
    Ok(entries)
}
