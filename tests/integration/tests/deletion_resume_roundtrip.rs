use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use sweep_engine::{
    ChannelId, CheckpointStore, DeleteOutcome, DeletionEngine, EngineConfig, EventSink,
    FanoutEventSink, InMemoryChannelLog, JsonFileCheckpointStore, JsonlEventSink,
    MemoryEventSink, Message, MessageId, MessageStore, RunOutcome, RunRegistry, UserId,
};
use tempfile::tempdir;

const CHANNEL: ChannelId = ChannelId(100);
const SECOND_CHANNEL: ChannelId = ChannelId(200);
const TARGET: UserId = UserId(7);
const OTHER: UserId = UserId(8);

fn message(channel: ChannelId, id: u64, author: UserId) -> Message {
    Message {
        id: MessageId(id),
        channel_id: channel,
        author_id: author,
        content: format!("message {id}"),
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        page_size: 5,
        checkpoint_interval: 2,
        pacing_delay: Duration::from_secs(1),
        rate_limit_backoff: Duration::from_secs(1),
    }
}

/// Requests cancellation through the registry right after `cancel_after`
/// is deleted, standing in for a `!cancel` arriving mid-run.
struct CancelAfterStore {
    inner: Arc<InMemoryChannelLog>,
    registry: Arc<RunRegistry>,
    cancel_after: MessageId,
}

#[async_trait]
impl MessageStore for CancelAfterStore {
    async fn delete(&self, message: &Message) -> DeleteOutcome {
        let outcome = self.inner.delete(message).await;
        if message.id == self.cancel_after {
            self.registry.request_cancel(message.channel_id);
        }
        outcome
    }
}

fn jsonl_fanout(path: &std::path::Path) -> FanoutEventSink {
    let sink: Arc<dyn EventSink> =
        Arc::new(JsonlEventSink::open(path.to_path_buf()).expect("events"));
    FanoutEventSink::new(vec![sink])
}

fn jsonl_events(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .expect("read events")
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("event line"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn integration_cancelled_run_resumes_from_file_checkpoint_after_restart() {
    let temp = tempdir().expect("tempdir");
    let checkpoints_path = temp.path().join("checkpoints.json");
    let events_path = temp.path().join("events.jsonl");
    let log = Arc::new(InMemoryChannelLog::with_messages((1..=20).map(|id| {
        message(CHANNEL, id, if id % 4 == 0 { OTHER } else { TARGET })
    })));

    let registry = Arc::new(RunRegistry::new());
    let first_events: Arc<dyn EventSink> = Arc::new(jsonl_fanout(&events_path));
    let first_engine = DeletionEngine::new(
        config(),
        log.clone(),
        Arc::new(CancelAfterStore {
            inner: log.clone(),
            registry: registry.clone(),
            cancel_after: MessageId(15),
        }),
        Arc::new(JsonFileCheckpointStore::open(checkpoints_path.clone()).expect("store")),
        first_events,
    );
    let handle = registry.try_start(CHANNEL, TARGET).expect("first run");
    let first = first_engine.run(handle, None).await.expect("first run");
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.final_cursor, Some(MessageId(16)));
    assert_eq!(first.counters.examined, 6);
    assert!(!registry.is_active(CHANNEL));

    let reopened = JsonFileCheckpointStore::open(checkpoints_path.clone()).expect("reopen");
    let saved = reopened
        .load(CHANNEL)
        .await
        .expect("load")
        .expect("checkpoint after cancel");
    assert_eq!(saved.message_id, MessageId(15));
    assert_eq!(saved.author_id, TARGET);

    let second_events: Arc<dyn EventSink> = Arc::new(jsonl_fanout(&events_path));
    let second_engine = DeletionEngine::new(
        config(),
        log.clone(),
        log.clone(),
        Arc::new(reopened),
        second_events,
    );
    let handle = registry.try_start(CHANNEL, TARGET).expect("second run");
    let second = second_engine.run(handle, None).await.expect("second run");
    assert_eq!(second.outcome, RunOutcome::Exhausted);
    assert_eq!(second.counters.examined, 14);

    let remaining = log.remaining(CHANNEL);
    assert_eq!(
        remaining,
        (1..=20)
            .filter(|id| id % 4 == 0)
            .map(MessageId)
            .collect::<Vec<_>>()
    );
    let after = JsonFileCheckpointStore::open(checkpoints_path).expect("reopen again");
    assert_eq!(after.load(CHANNEL).await.expect("load"), None);

    let events = jsonl_events(&events_path);
    let summaries = events
        .iter()
        .filter(|event| event["event"] == "summary")
        .map(|event| event["outcome"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(summaries, vec!["cancelled", "exhausted"]);
    let started = events
        .iter()
        .filter(|event| event["event"] == "started")
        .collect::<Vec<_>>();
    assert_eq!(started.len(), 2);
    assert_eq!(started[1]["resumed_from_checkpoint"], true);
    assert!(events
        .iter()
        .all(|event| event["timestamp_unix_ms"].as_u64().is_some()));
}

#[tokio::test(start_paused = true)]
async fn integration_cancel_all_stops_concurrent_channels_and_frees_slots() {
    let log = Arc::new(InMemoryChannelLog::with_messages(
        (1..=10)
            .map(|id| message(CHANNEL, id, TARGET))
            .chain((1..=10).map(|id| message(SECOND_CHANNEL, id, TARGET))),
    ));
    let events = Arc::new(MemoryEventSink::new());
    let engine = DeletionEngine::new(
        config(),
        log.clone(),
        log.clone(),
        Arc::new(sweep_engine::InMemoryCheckpointStore::new()),
        events.clone(),
    );
    let registry = Arc::new(RunRegistry::new());

    let mut runs = Vec::new();
    for channel in [CHANNEL, SECOND_CHANNEL] {
        let handle = registry.try_start(channel, TARGET).expect("start");
        let engine = engine.clone();
        runs.push(tokio::spawn(async move { engine.run(handle, None).await }));
    }
    assert!(registry.try_start(CHANNEL, OTHER).is_err());

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(registry.active_channels(), vec![CHANNEL, SECOND_CHANNEL]);
    assert_eq!(registry.cancel_all(), 2);

    for run in runs {
        let summary = run.await.expect("join").expect("run");
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert!(summary.counters.deleted >= 2 && summary.counters.deleted <= 4);
    }
    assert!(registry.active_channels().is_empty());
    assert_eq!(events.count("cancel_observed"), 2);
    assert!(registry.try_start(CHANNEL, TARGET).is_ok());
}
