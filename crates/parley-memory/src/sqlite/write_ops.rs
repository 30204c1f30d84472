use anyhow::{Context, Result};
use parley_core::{ChatLogEntry, MessageRecord, RunId};
use rusqlite::params;
use tracing::debug;

use super::{SqliteStore, helpers};

/// Insert all records in one transaction; any failure leaves the table as
/// it was.
pub(super) fn append(store: &SqliteStore, records: &[MessageRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let mut conn = store.conn.lock().expect("turn store mutex poisoned");
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "
            INSERT INTO model_records
                (id, conversation, actor_id, kind, parts, metadata, run_id, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )?;

        for record in records {
            let parts = helpers::to_json(&record.parts)
                .with_context(|| format!("failed to encode parts of record {}", record.id))?;
            let metadata = helpers::to_json(&record.metadata)
                .with_context(|| format!("failed to encode metadata of record {}", record.id))?;
            stmt.execute(params![
                record.id.to_string(),
                record.conversation.to_string(),
                record.actor_id,
                record.kind.as_str(),
                parts,
                metadata,
                record.run_id.as_ref().map(RunId::as_str),
                helpers::micros_from_dt(record.timestamp),
            ])
            .with_context(|| format!("failed to insert record {}", record.id))?;
        }
    }
    tx.commit()?;
    drop(conn);

    debug!(count = records.len(), "records appended");
    Ok(())
}

pub(super) fn record_chat(store: &SqliteStore, entry: &ChatLogEntry) -> Result<()> {
    let conn = store.conn.lock().expect("turn store mutex poisoned");
    conn.execute(
        "
        INSERT INTO chat_log (conversation, actor_id, direction, content, timestamp)
        VALUES (?, ?, ?, ?, ?)
        ",
        params![
            entry.conversation.to_string(),
            entry.actor_id,
            entry.direction.as_str(),
            entry.content,
            helpers::micros_from_dt(entry.timestamp),
        ],
    )?;
    drop(conn);
    Ok(())
}
