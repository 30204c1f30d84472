//! Core trait definitions for Parley.
//!
//! These define the contracts between components. Implementations live in
//! other crates (parley-memory for storage, parley-channels for channels,
//! parley-gateway for the orchestrator's handler).

use crate::types::{
    ChatLogEntry, ConversationKey, InboundMessage, MessageRecord, OutboundMessage, RunSummary,
    Turn,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Durable, append-only log of model request/response records.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Distinct non-null run ids for `conversation`, most recently active
    /// first (by the latest record timestamp of each run), ties broken by run
    /// id ascending. At most `limit` entries.
    async fn query_run_ids(
        &self,
        conversation: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<RunSummary>>;

    /// Every record of `conversation` with `start <= timestamp <= end`,
    /// orphans included, ordered by `(timestamp, id)` ascending.
    async fn query_time_window(
        &self,
        conversation: &ConversationKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>>;

    /// Append records. All-or-nothing.
    async fn append(&self, records: &[MessageRecord]) -> Result<()>;

    /// Every conversation with at least one record.
    async fn conversations(&self) -> Result<Vec<ConversationKey>>;
}

/// Plain chat transcript, kept apart from the model log.
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn record(&self, entry: &ChatLogEntry) -> Result<()>;

    /// Entries with `start <= timestamp <= end`, oldest first.
    async fn recent(
        &self,
        conversation: &ConversationKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ChatLogEntry>>;
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The model invocation behind a batch. Implementations talk to an LLM;
/// the runtime only sees records in and records out.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Produce response records for `request`, given prior turns as context.
    /// The caller stamps run ids and persists everything.
    async fn respond(&self, history: &[Turn], request: &MessageRecord)
    -> Result<Vec<MessageRecord>>;
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A communication channel (terminal, chat protocol adapter, ...).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique identifier for this channel.
    fn id(&self) -> &str;

    /// Receive the next inbound message (blocks until available).
    async fn recv(&mut self) -> Result<InboundMessage>;

    /// Handle for sending replies from tasks that don't own the channel.
    fn outbound(&self) -> Arc<dyn OutboundSink>;
}

/// Send half of a channel, shareable with batch handlers.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn deliver(&self, msg: OutboundMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Processes one drained batch for a key. Called at most once at a time per
/// key by [`CoalescingScheduler`](crate::batcher::CoalescingScheduler).
#[async_trait]
pub trait BatchHandler<K, T>: Send + Sync
where
    K: Send + Sync,
    T: Send,
{
    type Output: Send;

    async fn handle(&self, key: &K, batch: Vec<T>) -> Result<Self::Output>;
}

#[async_trait]
impl<K, T, H> BatchHandler<K, T> for Arc<H>
where
    K: Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + ?Sized,
{
    type Output = H::Output;

    async fn handle(&self, key: &K, batch: Vec<T>) -> Result<Self::Output> {
        self.as_ref().handle(key, batch).await
    }
}
