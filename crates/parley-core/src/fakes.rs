//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::traits::{Agent, Channel, ChatLog, OutboundSink, TurnStore};
use crate::types::{
    ChatLogEntry, ContentPart, ConversationKey, InboundMessage, MessageRecord, OutboundMessage,
    RunSummary, Turn,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// InMemoryTurnStore
// ---------------------------------------------------------------------------

/// Turn store over a plain vector. Mirrors the SQLite store's ordering
/// rules. Can be switched into a failing mode to exercise error paths.
#[derive(Debug, Default)]
pub struct InMemoryTurnStore {
    records: Mutex<Vec<MessageRecord>>,
    failing: AtomicBool,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call returns an error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn all_records(&self) -> Vec<MessageRecord> {
        self.records.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("in-memory store set to fail");
        }
        Ok(())
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    async fn query_run_ids(
        &self,
        conversation: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<RunSummary>> {
        self.check()?;
        let records = self.records.lock().unwrap();
        let mut runs: HashMap<_, (DateTime<Utc>, DateTime<Utc>)> = HashMap::new();
        for record in records.iter().filter(|r| &r.conversation == conversation) {
            let Some(run_id) = &record.run_id else {
                continue;
            };
            let span = runs
                .entry(run_id.clone())
                .or_insert((record.timestamp, record.timestamp));
            span.0 = span.0.min(record.timestamp);
            span.1 = span.1.max(record.timestamp);
        }

        let mut runs: Vec<RunSummary> = runs
            .into_iter()
            .map(|(run_id, (first_seen, last_seen))| RunSummary {
                run_id,
                first_seen,
                last_seen,
            })
            .collect();
        runs.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs.truncate(limit);
        Ok(runs)
    }

    async fn query_time_window(
        &self,
        conversation: &ConversationKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        self.check()?;
        let mut window: Vec<MessageRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.conversation == conversation)
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        window.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(window)
    }

    async fn append(&self, records: &[MessageRecord]) -> Result<()> {
        self.check()?;
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn conversations(&self) -> Result<Vec<ConversationKey>> {
        self.check()?;
        let keys: BTreeSet<ConversationKey> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.conversation.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// InMemoryChatLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryChatLog {
    entries: Mutex<Vec<ChatLogEntry>>,
}

impl InMemoryChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ChatLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatLog for InMemoryChatLog {
    async fn record(&self, entry: &ChatLogEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn recent(
        &self,
        conversation: &ConversationKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ChatLogEntry>> {
        let mut found: Vec<ChatLogEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.conversation == conversation)
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.timestamp);
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// FakeAgent
// ---------------------------------------------------------------------------

/// Agent that answers every request with a fixed reply and remembers what
/// it was shown.
#[derive(Debug)]
pub struct FakeAgent {
    pub reply: Mutex<String>,
    /// `(history turn count, request text)` per call.
    pub seen: Mutex<Vec<(usize, String)>>,
    pub fail: AtomicBool,
}

impl FakeAgent {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Mutex::new(reply.into()),
            seen: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn seen(&self) -> Vec<(usize, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for FakeAgent {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn respond(
        &self,
        history: &[Turn],
        request: &MessageRecord,
    ) -> Result<Vec<MessageRecord>> {
        self.seen
            .lock()
            .unwrap()
            .push((history.len(), request.text()));
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("fake agent failure");
        }
        let reply = self.reply.lock().unwrap().clone();
        Ok(vec![MessageRecord::response(
            request.conversation.clone(),
            vec![ContentPart::text(reply)],
        )])
    }
}

// ---------------------------------------------------------------------------
// RecordingSink / FakeChannel
// ---------------------------------------------------------------------------

/// Outbound sink that keeps everything delivered to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.delivered.lock().unwrap())
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn deliver(&self, msg: OutboundMessage) -> Result<()> {
        self.delivered.lock().unwrap().push(msg);
        Ok(())
    }
}

/// Fake channel for testing. `recv` errors once the queue runs dry, which
/// ends an inbound loop.
#[derive(Debug)]
pub struct FakeChannel {
    pub id: String,
    pub inbound: Mutex<VecDeque<InboundMessage>>,
    pub sink: Arc<RecordingSink>,
}

impl FakeChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inbound: Mutex::new(VecDeque::new()),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    pub fn push_inbound(&self, msg: InboundMessage) {
        self.inbound.lock().unwrap().push_back(msg);
    }

    pub fn take_outbound(&self) -> Vec<OutboundMessage> {
        self.sink.take()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn recv(&mut self) -> Result<InboundMessage> {
        let next = self.inbound.lock().unwrap().pop_front();
        next.ok_or_else(|| anyhow::anyhow!("no inbound messages"))
    }

    fn outbound(&self) -> Arc<dyn OutboundSink> {
        Arc::clone(&self.sink) as Arc<dyn OutboundSink>
    }
}
