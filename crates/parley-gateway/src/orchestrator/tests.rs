use super::*;
use crate::config::Config;
use chrono::Utc;
use parley_core::BatcherConfig;
use parley_core::fakes::{FakeAgent, FakeChannel, InMemoryChatLog, InMemoryTurnStore, RecordingSink};
use std::sync::atomic::Ordering;
use std::time::Duration;

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<InMemoryTurnStore>,
    agent: Arc<FakeAgent>,
    chat_log: Arc<InMemoryChatLog>,
    cache: Arc<ConversationCache>,
    sink: Arc<RecordingSink>,
}

fn harness_with(store: Arc<InMemoryTurnStore>, sink: Arc<RecordingSink>) -> Harness {
    let agent = Arc::new(FakeAgent::new("ok"));
    let chat_log = Arc::new(InMemoryChatLog::new());
    let cache = Arc::new(ConversationCache::new(4, 8));
    let handler = ReplyHandler::new(
        Arc::clone(&agent) as Arc<dyn Agent>,
        Arc::clone(&store) as Arc<dyn TurnStore>,
        Arc::clone(&chat_log) as Arc<dyn ChatLog>,
        Arc::clone(&cache),
        Arc::clone(&sink) as Arc<dyn OutboundSink>,
        4,
    );
    let scheduler = Scheduler::new(
        Arc::new(handler),
        BatcherConfig {
            batch_delay: Duration::from_millis(500),
            max_keys: 8,
        },
    );
    let triggers = Triggers::from_config(&Config::default()).unwrap();
    Harness {
        orchestrator: Orchestrator::new(
            scheduler,
            triggers,
            Arc::clone(&chat_log) as Arc<dyn ChatLog>,
        ),
        store,
        agent,
        chat_log,
        cache,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(InMemoryTurnStore::new()),
        Arc::new(RecordingSink::new()),
    )
}

fn inbound(conversation: ConversationKey, sender: &str, content: &str) -> InboundMessage {
    InboundMessage {
        channel: "fake".to_owned(),
        conversation,
        sender: sender.to_owned(),
        sender_name: None,
        content: content.to_owned(),
        timestamp: Utc::now(),
    }
}

fn group(sender: &str, content: &str) -> InboundMessage {
    inbound(ConversationKey::group("g1"), sender, content)
}

fn dm(content: &str) -> InboundMessage {
    inbound(ConversationKey::direct("alice"), "alice", content)
}

#[test]
fn request_lists_each_message_with_its_sender() {
    let mut named = group("bob", "yo");
    named.sender_name = Some("Bobby".to_owned());
    let batch = vec![group("alice", "hi"), named, group("alice", "again")];

    let request = build_request(&ConversationKey::group("g1"), &batch);

    assert_eq!(request.text(), "[alice] hi\n[Bobby] yo\n[alice] again");
    assert_eq!(request.parts.len(), 3);
    assert_eq!(request.actor_id, None);
    assert_eq!(request.metadata["senders"], "alice,bob");
    assert_eq!(request.metadata["batch_len"], "3");
}

#[test]
fn request_from_one_sender_keeps_actor() {
    let request = build_request(&ConversationKey::direct("alice"), &[dm("a"), dm("b")]);
    assert_eq!(request.actor_id.as_deref(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn chatter_is_answered_once_when_the_timer_fires() {
    let h = harness();
    h.orchestrator.accept(group("alice", "hi")).await;
    h.orchestrator.accept(group("bob", "yo")).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.agent.seen().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.agent.seen(), vec![(0, "[alice] hi\n[bob] yo".to_owned())]);

    let records = h.store.all_records();
    assert_eq!(records.len(), 2);
    assert!(records[0].run_id.is_some());
    assert_eq!(records[0].run_id, records[1].run_id);

    let delivered = h.sink.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].text(), "ok");
    assert_eq!(delivered[0].channel, "fake");
    assert_eq!(delivered[0].conversation, ConversationKey::group("g1"));

    let directions: Vec<ChatDirection> = h.chat_log.entries().iter().map(|e| e.direction).collect();
    assert_eq!(
        directions,
        vec![ChatDirection::Inbound, ChatDirection::Inbound, ChatDirection::Outbound]
    );
    assert_eq!(h.cache.len(&ConversationKey::group("g1")), 1);
}

#[tokio::test(start_paused = true)]
async fn mention_flushes_everything_queued_so_far() {
    let h = harness();
    h.orchestrator.accept(group("alice", "lunch?")).await;
    h.orchestrator.accept(group("bob", "@parley pick a place")).await;
    h.orchestrator.shutdown().await;

    assert_eq!(
        h.agent.seen(),
        vec![(0, "[alice] lunch?\n[bob] @parley pick a place".to_owned())]
    );

    // The cancelled timer does not produce a second call.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.agent.seen().len(), 1);
    assert!(!h.orchestrator.scheduler().has_pending(&ConversationKey::group("g1")));
}

#[tokio::test(start_paused = true)]
async fn later_batches_see_earlier_turns() {
    let h = harness();
    h.orchestrator.accept(dm("first")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.orchestrator.accept(dm("second")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        h.agent.seen(),
        vec![
            (0, "[alice] first".to_owned()),
            (1, "[alice] second".to_owned()),
        ]
    );
    assert_eq!(h.store.all_records().len(), 4);
    assert_eq!(h.cache.len(&ConversationKey::direct("alice")), 2);
}

#[tokio::test(start_paused = true)]
async fn cold_cache_loads_history_from_store() {
    let store = Arc::new(InMemoryTurnStore::new());
    let key = ConversationKey::direct("alice");
    let run = RunId::new("earlier");
    store
        .append(&[
            MessageRecord::request(key.clone(), None, vec![ContentPart::text("[alice] old")])
                .with_run_id(run.clone()),
            MessageRecord::response(key.clone(), vec![ContentPart::text("old reply")])
                .with_run_id(run),
        ])
        .await
        .unwrap();

    let h = harness_with(store, Arc::new(RecordingSink::new()));
    h.orchestrator.accept(dm("back again")).await;
    h.orchestrator.shutdown().await;

    assert_eq!(h.agent.seen(), vec![(1, "[alice] back again".to_owned())]);
    assert_eq!(h.cache.len(&key), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_agent_call_persists_and_delivers_nothing() {
    let h = harness();
    h.agent.fail.store(true, Ordering::SeqCst);
    h.orchestrator.accept(dm("lost")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(h.store.all_records().is_empty());
    assert!(h.sink.take().is_empty());
    assert_eq!(h.cache.len(&ConversationKey::direct("alice")), 0);

    // The failed batch is dropped, not retried with the next one.
    h.agent.fail.store(false, Ordering::SeqCst);
    h.orchestrator.accept(dm("kept")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let seen = h.agent.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1], (0, "[alice] kept".to_owned()));
    assert_eq!(h.sink.take().len(), 1);
}

#[tokio::test]
async fn store_failure_surfaces_and_skips_delivery() {
    let h = harness();
    let key = ConversationKey::direct("alice");
    // Warm the cache so only the append hits the failing store.
    h.cache
        .get_or_load(&key, || async {
            Ok(vec![Turn::new(MessageRecord::request(key.clone(), None, vec![
                ContentPart::text("x"),
            ]))])
        })
        .await
        .unwrap();
    h.store.set_failing(true);

    let err = h
        .orchestrator
        .scheduler()
        .handler()
        .handle(&key, vec![dm("hello")])
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("turn store unavailable: append"));
    assert!(h.sink.take().is_empty());
    assert_eq!(h.cache.len(&key), 1);
}

#[tokio::test]
async fn history_load_failure_is_reported() {
    let h = harness();
    h.store.set_failing(true);

    let err = h
        .orchestrator
        .scheduler()
        .handler()
        .handle(&ConversationKey::direct("alice"), vec![dm("hello")])
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("turn store unavailable: query_run_ids"));
    assert!(h.agent.seen().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_feeds_channel_messages_until_it_fails() {
    let mut channel = FakeChannel::new("fake");
    channel.push_inbound(dm("one"));
    channel.push_inbound(group("bob", "just chatting"));
    let h = harness_with(Arc::new(InMemoryTurnStore::new()), Arc::clone(&channel.sink));

    let err = h
        .orchestrator
        .run(&mut channel, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no inbound messages"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.orchestrator.shutdown().await;

    let delivered = channel.take_outbound();
    assert_eq!(delivered.len(), 2);
    assert_eq!(h.chat_log.entries().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_batches_still_waiting_for_timer() {
    let mut channel = FakeChannel::new("fake");
    channel.push_inbound(group("bob", "just chatting"));
    let h = harness_with(Arc::new(InMemoryTurnStore::new()), Arc::clone(&channel.sink));

    h.orchestrator
        .run(&mut channel, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(h.agent.seen().is_empty());

    let flushed = h.orchestrator.shutdown().await;

    assert_eq!(flushed, 1);
    assert_eq!(h.agent.seen(), vec![(0, "[bob] just chatting".to_owned())]);
    assert_eq!(h.store.all_records().len(), 2);
    assert_eq!(channel.take_outbound().len(), 1);
    assert!(h.orchestrator.scheduler().busy_keys().is_empty());

    // The timer that was armed for the batch finds nothing left.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.agent.seen().len(), 1);
}

#[tokio::test]
async fn run_returns_once_cancelled() {
    let mut channel = FakeChannel::new("fake");
    channel.push_inbound(dm("never read"));
    let h = harness();

    let token = CancellationToken::new();
    token.cancel();
    h.orchestrator.run(&mut channel, token).await.unwrap();

    assert!(h.chat_log.entries().is_empty());
    assert_eq!(channel.inbound.lock().unwrap().len(), 1);
}
