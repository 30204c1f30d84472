use anyhow::Result;
use rusqlite::Connection;

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS model_records (
            id TEXT PRIMARY KEY,
            conversation TEXT NOT NULL,
            actor_id TEXT,
            kind TEXT NOT NULL,
            parts TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            run_id TEXT,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_window
            ON model_records(conversation, timestamp, id);
        CREATE INDEX IF NOT EXISTS idx_records_run
            ON model_records(conversation, run_id);

        CREATE TABLE IF NOT EXISTS chat_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_log_window
            ON chat_log(conversation, timestamp);
        ",
    )?;

    Ok(())
}
