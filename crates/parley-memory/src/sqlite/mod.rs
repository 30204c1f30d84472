mod helpers;
mod query;
mod schema;
mod write_ops;

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{
    ChatLog, ChatLogEntry, ConversationKey, MessageRecord, RunSummary, TurnStore,
};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, instrument};

/// SQLite-backed turn store and chat log, sharing one database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        schema::init_schema(&conn)?;
        debug!(path = %path.display(), "turn store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TurnStore for SqliteStore {
    #[instrument(skip(self, conversation), fields(conversation = %conversation))]
    async fn query_run_ids(
        &self,
        conversation: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<RunSummary>> {
        query::run_ids(self, conversation, limit)
    }

    #[instrument(skip(self, conversation), fields(conversation = %conversation))]
    async fn query_time_window(
        &self,
        conversation: &ConversationKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        query::time_window(self, conversation, start, end)
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn append(&self, records: &[MessageRecord]) -> Result<()> {
        write_ops::append(self, records)
    }

    #[instrument(skip(self))]
    async fn conversations(&self) -> Result<Vec<ConversationKey>> {
        query::conversations(self)
    }
}

#[async_trait]
impl ChatLog for SqliteStore {
    #[instrument(skip(self, entry), fields(conversation = %entry.conversation, direction = entry.direction.as_str()))]
    async fn record(&self, entry: &ChatLogEntry) -> Result<()> {
        write_ops::record_chat(self, entry)
    }

    #[instrument(skip(self, conversation), fields(conversation = %conversation))]
    async fn recent(
        &self,
        conversation: &ConversationKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ChatLogEntry>> {
        query::chat_window(self, conversation, start, end)
    }
}
