use chrono::{DateTime, Duration, TimeZone, Utc};
use parley_core::{
    ChatDirection, ChatLog, ChatLogEntry, ContentPart, ConversationKey, MessageRecord, RecordId,
    RunId, TurnReconstructor, TurnStore,
};
use std::sync::Arc;
use uuid::Uuid;

use super::SqliteStore;

fn store() -> SqliteStore {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parley.db");
    let store = SqliteStore::open(path).unwrap();
    std::mem::forget(dir);
    store
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

fn conv() -> ConversationKey {
    ConversationKey::group("g1")
}

fn record(secs: i64, run: Option<&str>, text: &str) -> MessageRecord {
    let record = MessageRecord::request(conv(), Some("alice".to_owned()), vec![
        ContentPart::text(text),
    ])
    .with_timestamp(at(secs));
    match run {
        Some(run) => record.with_run_id(RunId::new(run)),
        None => record,
    }
}

fn texts(records: &[MessageRecord]) -> Vec<String> {
    records.iter().map(MessageRecord::text).collect()
}

#[tokio::test]
async fn append_and_window_round_trip() {
    let store = store();
    let ts = at(10) + Duration::microseconds(123_456);
    let original = MessageRecord::response(conv(), vec![
        ContentPart::text("hello"),
        ContentPart::Image {
            uri: "file:///tmp/cat.png".to_owned(),
            name: Some("cat.png".to_owned()),
            summary: None,
        },
    ])
    .with_timestamp(ts)
    .with_run_id(RunId::new("r1"))
    .with_metadata("model", "echo");

    store.append(std::slice::from_ref(&original)).await.unwrap();
    let loaded = store.query_time_window(&conv(), ts, ts).await.unwrap();

    assert_eq!(loaded, vec![original]);
}

#[tokio::test]
async fn window_is_inclusive_and_ordered() {
    let store = store();
    store
        .append(&[
            record(3, None, "c"),
            record(1, None, "a"),
            record(2, None, "b"),
            record(4, None, "outside"),
            record(0, None, "before"),
        ])
        .await
        .unwrap();

    let loaded = store.query_time_window(&conv(), at(1), at(3)).await.unwrap();
    assert_eq!(texts(&loaded), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn same_timestamp_orders_by_id() {
    let store = store();
    let mut first = record(5, None, "first");
    first.id = RecordId::from_uuid(Uuid::from_u128(1));
    let mut second = record(5, None, "second");
    second.id = RecordId::from_uuid(Uuid::from_u128(2));

    store.append(&[second, first]).await.unwrap();
    let loaded = store.query_time_window(&conv(), at(5), at(5)).await.unwrap();
    assert_eq!(texts(&loaded), vec!["first", "second"]);
}

#[tokio::test]
async fn run_ids_by_latest_activity_then_id() {
    let store = store();
    store
        .append(&[
            record(1, Some("old"), "q"),
            record(2, Some("old"), "a"),
            record(3, None, "orphan"),
            record(4, Some("zeta"), "q"),
            record(9, Some("zeta"), "a"),
            record(5, Some("alpha"), "q"),
            record(9, Some("alpha"), "a"),
        ])
        .await
        .unwrap();

    let runs = store.query_run_ids(&conv(), 10).await.unwrap();
    let ids: Vec<&str> = runs.iter().map(|run| run.run_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "zeta", "old"]);
    assert_eq!(runs[0].first_seen, at(5));
    assert_eq!(runs[0].last_seen, at(9));

    let top = store.query_run_ids(&conv(), 1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].run_id.as_str(), "alpha");
}

#[tokio::test]
async fn failed_append_writes_nothing() {
    let store = store();
    let dup = record(1, Some("r1"), "dup");
    let err = store
        .append(&[record(0, Some("r1"), "fine"), dup.clone(), dup])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to insert record"));

    let loaded = store.query_time_window(&conv(), at(0), at(10)).await.unwrap();
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn conversations_lists_each_key_once() {
    let store = store();
    let dm = MessageRecord::request(ConversationKey::direct("bob"), Some("bob".to_owned()), vec![
        ContentPart::text("hi"),
    ]);
    store
        .append(&[record(1, None, "a"), record(2, None, "b"), dm])
        .await
        .unwrap();

    let keys = store.conversations().await.unwrap();
    assert_eq!(keys, vec![ConversationKey::direct("bob"), conv()]);
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("parley.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store.append(&[record(1, Some("r1"), "kept")]).await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let runs = store.query_run_ids(&conv(), 4).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(store.path(), path.as_path());
}

#[tokio::test]
async fn reconstructs_recent_turns_from_disk() {
    let store = Arc::new(store());
    let mut records = Vec::new();
    for (i, run) in ["r1", "r2", "r3", "r4", "r5"].iter().enumerate() {
        let base = i64::try_from(i).unwrap() * 10;
        records.push(record(base, Some(run), &format!("{run} question")));
        records.push(record(base + 1, Some(run), &format!("{run} answer")));
    }
    records.push(record(35, None, "aside"));
    records.push(record(2, None, "ancient"));
    store.append(&records).await.unwrap();

    let reconstructor = TurnReconstructor::new(store);
    let turns = reconstructor.reconstruct(&conv(), 2).await.unwrap();

    let shape: Vec<Vec<String>> = turns.iter().map(|turn| texts(turn.records())).collect();
    assert_eq!(shape, vec![
        vec!["r4 question", "r4 answer"],
        vec!["aside"],
        vec!["r5 question", "r5 answer"],
    ]);
}

#[tokio::test]
async fn chat_log_window() {
    let store = store();
    let entry = |secs: i64, direction: ChatDirection, content: &str| ChatLogEntry {
        conversation: conv(),
        actor_id: "alice".to_owned(),
        direction,
        content: content.to_owned(),
        timestamp: at(secs),
    };

    store.record(&entry(0, ChatDirection::Inbound, "too old")).await.unwrap();
    store.record(&entry(60, ChatDirection::Inbound, "hi bot")).await.unwrap();
    store.record(&entry(61, ChatDirection::Outbound, "hello")).await.unwrap();

    let recent = store.recent(&conv(), at(30), at(120)).await.unwrap();
    assert_eq!(recent, vec![
        entry(60, ChatDirection::Inbound, "hi bot"),
        entry(61, ChatDirection::Outbound, "hello"),
    ]);

    let other = store
        .recent(&ConversationKey::direct("alice"), at(0), at(120))
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn unrepresentable_timestamp_is_an_error() {
    let store = store();
    store
        .conn
        .lock()
        .unwrap()
        .execute(
            "INSERT INTO model_records (id, conversation, kind, run_id, timestamp)
             VALUES (?, ?, 'request', 'r1', ?)",
            rusqlite::params![Uuid::now_v7().to_string(), conv().to_string(), i64::MAX],
        )
        .unwrap();

    let err = store.query_run_ids(&conv(), 4).await.unwrap_err();
    assert!(
        format!("{err:#}").contains("timestamp out of range"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn unencodable_value_is_an_error() {
    let mut odd = std::collections::HashMap::new();
    odd.insert((1_u8, 2_u8), "pair keys have no JSON form");
    assert!(super::helpers::to_json(&odd).is_err());
    assert_eq!(
        super::helpers::to_json(&vec![ContentPart::text("hi")]).unwrap(),
        r#"[{"type":"text","text":"hi"}]"#
    );
}
