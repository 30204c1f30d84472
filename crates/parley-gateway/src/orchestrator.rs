//! Glue between a channel, the coalescing scheduler and the agent.
//!
//! Inbound messages are pushed into the scheduler keyed by conversation.
//! Each flushed batch becomes one request record; the agent answers with
//! history from the conversation cache, and the whole exchange is stamped
//! with a fresh run id, persisted, cached and delivered.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parley_core::{
    Agent, BatchHandler, Channel, ChatDirection, ChatLog, ChatLogEntry, CoalescingScheduler,
    ContentPart, ConversationKey, InboundMessage, MessageRecord, OutboundMessage, OutboundSink,
    RunId, Turn, TurnReconstructor, TurnStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::conversation_cache::ConversationCache;
use crate::trigger::{TriggerDecision, Triggers};

pub(crate) type Scheduler = CoalescingScheduler<ConversationKey, InboundMessage, Arc<ReplyHandler>>;

/// What one handled batch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchReport {
    pub run_id: RunId,
    pub items: usize,
    pub replies: usize,
}

/// Turns a batch of inbound messages into one agent run.
pub(crate) struct ReplyHandler {
    agent: Arc<dyn Agent>,
    store: Arc<dyn TurnStore>,
    chat_log: Arc<dyn ChatLog>,
    cache: Arc<ConversationCache>,
    reconstructor: TurnReconstructor,
    sink: Arc<dyn OutboundSink>,
    history_turns: usize,
}

impl std::fmt::Debug for ReplyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandler")
            .field("agent", &self.agent.name())
            .field("history_turns", &self.history_turns)
            .finish_non_exhaustive()
    }
}

impl ReplyHandler {
    pub(crate) fn new(
        agent: Arc<dyn Agent>,
        store: Arc<dyn TurnStore>,
        chat_log: Arc<dyn ChatLog>,
        cache: Arc<ConversationCache>,
        sink: Arc<dyn OutboundSink>,
        history_turns: usize,
    ) -> Self {
        Self {
            reconstructor: TurnReconstructor::new(Arc::clone(&store)),
            agent,
            store,
            chat_log,
            cache,
            sink,
            history_turns,
        }
    }

    async fn log_chat(&self, entry: ChatLogEntry) {
        if let Err(error) = self.chat_log.record(&entry).await {
            warn!(
                conversation = %entry.conversation,
                error = %format!("{error:#}"),
                "failed to record chat log entry"
            );
        }
    }
}

/// One request record for the whole batch, one `[sender] text` part per
/// inbound message in arrival order.
pub(crate) fn build_request(key: &ConversationKey, batch: &[InboundMessage]) -> MessageRecord {
    let parts = batch
        .iter()
        .map(|msg| ContentPart::text(format!("[{}] {}", msg.display_sender(), msg.content)))
        .collect();

    let single_sender = batch
        .first()
        .filter(|first| batch.iter().all(|msg| msg.sender == first.sender))
        .map(|first| first.sender.clone());

    let mut senders: Vec<&str> = Vec::new();
    for msg in batch {
        if !senders.contains(&msg.sender.as_str()) {
            senders.push(&msg.sender);
        }
    }

    MessageRecord::request(key.clone(), single_sender, parts)
        .with_metadata("senders", senders.join(","))
        .with_metadata("batch_len", batch.len().to_string())
}

#[async_trait]
impl BatchHandler<ConversationKey, InboundMessage> for ReplyHandler {
    type Output = BatchReport;

    async fn handle(&self, key: &ConversationKey, batch: Vec<InboundMessage>) -> Result<BatchReport> {
        let channel = batch
            .first()
            .map(|msg| msg.channel.clone())
            .context("empty batch")?;
        let request = build_request(key, &batch);

        let history = self
            .cache
            .get_or_load(key, || self.reconstructor.reconstruct(key, self.history_turns))
            .await?;
        debug!(
            conversation = %key,
            history_turns = history.len(),
            batch_len = batch.len(),
            "calling agent"
        );

        let responses = self
            .agent
            .respond(&history, &request)
            .await
            .with_context(|| format!("agent '{}' failed", self.agent.name()))?;

        let run_id = RunId::generate();
        let mut records = Vec::with_capacity(responses.len() + 1);
        records.push(request.with_run_id(run_id.clone()));
        records.extend(
            responses
                .into_iter()
                .map(|response| response.with_run_id(run_id.clone())),
        );

        self.store
            .append(&records)
            .await
            .context("turn store unavailable: append")?;

        let turn = Turn::from_records(records)?;
        let replies: Vec<MessageRecord> = turn.records()[1..].to_vec();
        self.cache.append(key, turn);
        debug!(conversation = %key, cached_turns = self.cache.len(key), "turn cached");

        for reply in &replies {
            let outbound = OutboundMessage {
                channel: channel.clone(),
                conversation: key.clone(),
                parts: reply.parts.clone(),
            };
            let text = outbound.text();
            self.sink
                .deliver(outbound)
                .await
                .with_context(|| format!("failed to deliver reply to {key}"))?;
            self.log_chat(ChatLogEntry {
                conversation: key.clone(),
                actor_id: self.agent.name().to_owned(),
                direction: ChatDirection::Outbound,
                content: text,
                timestamp: Utc::now(),
            })
            .await;
        }

        info!(
            conversation = %key,
            run_id = %run_id,
            items = batch.len(),
            replies = replies.len(),
            "batch answered"
        );
        Ok(BatchReport {
            run_id,
            items: batch.len(),
            replies: replies.len(),
        })
    }
}

/// Reads a channel and feeds the scheduler.
pub(crate) struct Orchestrator {
    scheduler: Scheduler,
    triggers: Triggers,
    chat_log: Arc<dyn ChatLog>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("keys", &self.scheduler.key_count())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub(crate) fn new(scheduler: Scheduler, triggers: Triggers, chat_log: Arc<dyn ChatLog>) -> Self {
        Self {
            scheduler,
            triggers,
            chat_log,
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Receive until the channel fails or `shutdown` fires.
    pub(crate) async fn run<C>(&self, channel: &mut C, shutdown: CancellationToken) -> Result<()>
    where
        C: Channel + ?Sized,
    {
        info!(channel = channel.id(), "inbound loop listening");
        loop {
            let inbound = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("inbound loop stopping");
                    return Ok(());
                }
                received = channel.recv() => received?,
            };
            self.accept(inbound).await;
        }
    }

    /// Log, queue and, if the trigger says so, force out one message.
    pub(crate) async fn accept(&self, inbound: InboundMessage) {
        let key = inbound.conversation.clone();
        let entry = ChatLogEntry {
            conversation: key.clone(),
            actor_id: inbound.sender.clone(),
            direction: ChatDirection::Inbound,
            content: inbound.content.clone(),
            timestamp: inbound.timestamp,
        };
        if let Err(error) = self.chat_log.record(&entry).await {
            warn!(conversation = %key, error = %format!("{error:#}"), "failed to record chat log entry");
        }

        let decision = self.triggers.evaluate(&inbound);
        debug!(conversation = %key, sender = %inbound.sender, ?decision, "inbound queued");
        self.scheduler.push(key.clone(), inbound);

        if decision == TriggerDecision::ConsumeNow {
            self.spawn_consume(key);
        }
    }

    fn spawn_consume(&self, key: ConversationKey) {
        let scheduler = self.scheduler.clone();
        let span = info_span!("consume", conversation = %key);
        self.tasks.spawn(
            async move {
                match scheduler.consume(&key).await {
                    Ok(Some(report)) => debug!(
                        run_id = %report.run_id,
                        items = report.items,
                        replies = report.replies,
                        "batch handled"
                    ),
                    Ok(None) => debug!("nothing left to consume"),
                    Err(error) => {
                        error!(error = %format!("{error:#}"), "batch failed");
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Flush every conversation that still has queued items or a running
    /// handler, then wait for all flushes, forced ones included. Returns how
    /// many conversations were flushed here.
    pub(crate) async fn shutdown(&self) -> usize {
        let busy = self.scheduler.busy_keys();
        let flushed = busy.len();
        for key in busy {
            debug!(conversation = %key, "flushing on shutdown");
            self.spawn_consume(key);
        }
        self.tasks.close();
        self.tasks.wait().await;
        flushed
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests;
