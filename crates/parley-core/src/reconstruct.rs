//! Rebuild the most recent turns of a conversation from the flat record log.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use crate::traits::TurnStore;
use crate::types::{ConversationKey, MessageRecord, Turn};

#[derive(Clone)]
pub struct TurnReconstructor {
    store: Arc<dyn TurnStore>,
}

impl std::fmt::Debug for TurnReconstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnReconstructor").finish_non_exhaustive()
    }
}

impl TurnReconstructor {
    pub fn new(store: Arc<dyn TurnStore>) -> Self {
        Self { store }
    }

    /// The `max_turns` most recently active runs, plus any orphan records
    /// that fall between them, as turns ordered oldest first.
    pub async fn reconstruct(
        &self,
        conversation: &ConversationKey,
        max_turns: usize,
    ) -> Result<Vec<Turn>> {
        if max_turns == 0 {
            return Ok(Vec::new());
        }

        let runs = self
            .store
            .query_run_ids(conversation, max_turns)
            .await
            .context("turn store unavailable: query_run_ids")?;

        let Some(start) = runs.iter().map(|run| run.first_seen).min() else {
            debug!(conversation = %conversation, "no runs recorded");
            return Ok(Vec::new());
        };
        let Some(end) = runs.iter().map(|run| run.last_seen).max() else {
            return Ok(Vec::new());
        };

        let records = self
            .store
            .query_time_window(conversation, start, end)
            .await
            .context("turn store unavailable: query_time_window")?;

        let turns = partition_turns(records);
        debug!(
            conversation = %conversation,
            runs = runs.len(),
            turns = turns.len(),
            "turns reconstructed"
        );
        Ok(turns)
    }
}

/// Split time-ordered records into turns wherever `run_id` changes between
/// neighbours. A run that is interrupted by other records yields more than
/// one turn; consecutive orphans form a single turn.
pub fn partition_turns(records: Vec<MessageRecord>) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for record in records {
        match turns.last_mut() {
            Some(turn) if turn.run_id() == record.run_id.as_ref() => turn.push(record),
            _ => turns.push(Turn::new(record)),
        }
    }
    turns
}
