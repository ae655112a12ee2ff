use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use vigil_core::config::ConfidenceThresholds;
use vigil_core::feed::{ChannelSpec, FeedError, FeedSource};
use vigil_core::model_client::{ModelBackend, ModelError};
use vigil_core::models::{Field, MessageKey, NewRecord, RawItem, StoredRecord};
use vigil_core::normalize::CountryTable;
use vigil_core::store::{MemoryStore, MessageStore, RecordFilter, StoreError};
use vigil_server::subsystems::fallback::{FallbackBatcher, FallbackSettings};
use vigil_server::subsystems::pipeline::{Pipeline, PipelineSettings};
use vigil_server::subsystems::run_control::{RunController, RunError, RunStage};
use vigil_server::subsystems::translate::TranslationBatcher;

// ============================================================================
// Fixtures
// ============================================================================

fn item(channel: &str, id: i64, text: &str) -> RawItem {
    RawItem {
        source: format!("{} news", channel),
        channel: channel.into(),
        origin_message_id: id,
        orientation: "unknown".into(),
        label: None,
        text: text.into(),
        timestamp: Utc::now(),
    }
}

/// Serves fixed items per channel; channels mapped to an error fail instead.
struct FixedFeed {
    items: HashMap<String, Vec<RawItem>>,
    failing: HashMap<String, fn() -> FeedError>,
    calls: AtomicUsize,
}

impl FixedFeed {
    fn new(items: Vec<RawItem>) -> Self {
        let mut by_channel: HashMap<String, Vec<RawItem>> = HashMap::new();
        for i in items {
            by_channel.entry(i.channel.clone()).or_default().push(i);
        }
        Self {
            items: by_channel,
            failing: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, channel: &str, err: fn() -> FeedError) -> Self {
        self.failing.insert(channel.to_string(), err);
        self
    }
}

#[async_trait]
impl FeedSource for FixedFeed {
    async fn list_recent(
        &self,
        channel: &ChannelSpec,
        _since: DateTime<Utc>,
        cap: u32,
    ) -> Result<Vec<RawItem>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failing.get(&channel.channel) {
            return Err(err());
        }
        Ok(self
            .items
            .get(&channel.channel)
            .map(|v| v.iter().take(cap as usize).cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Signals on first call, then never answers.
struct StalledBackend {
    entered: Arc<Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl ModelBackend for StalledBackend {
    async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(String::new())
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

/// Lets the first `ok_calls` inserts through, then fails transiently.
struct FlakyStore {
    inner: MemoryStore,
    ok_calls: usize,
    insert_calls: AtomicUsize,
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn existing_keys(&self, keys: &[MessageKey]) -> Result<HashSet<MessageKey>, StoreError> {
        self.inner.existing_keys(keys).await
    }

    async fn insert_batch(&self, records: &[NewRecord]) -> Result<usize, StoreError> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.ok_calls {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.insert_batch(records).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.query(filter).await
    }

    async fn distinct_sources(&self) -> Result<Vec<String>, StoreError> {
        self.inner.distinct_sources().await
    }

    async fn recent_created_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError> {
        self.inner.recent_created_dates(limit).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.delete_older_than(cutoff).await
    }

    async fn health(&self) -> Result<String, StoreError> {
        self.inner.health().await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

fn countries() -> Arc<CountryTable> {
    Arc::new(CountryTable::new(
        HashMap::from([
            ("france".to_string(), "France".to_string()),
            ("ukraine".to_string(), "Ukraine".to_string()),
        ]),
        // Ukraine deliberately has no coordinates
        HashMap::from([("France".to_string(), [46.2, 2.2])]),
        vec![],
    ))
}

fn settings(channels: &[&str], chunk: usize, retries: usize) -> PipelineSettings {
    PipelineSettings {
        channels: channels
            .iter()
            .map(|c| ChannelSpec {
                channel: c.to_string(),
                label: None,
            })
            .collect(),
        window_hours: 24,
        max_messages_per_channel: 100,
        store_chunk_size: chunk,
        store_max_retries: retries,
        store_retry_delay_ms: 1,
        retention_days: 10,
    }
}

fn pipeline(
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn MessageStore>,
    backend: Option<Arc<dyn ModelBackend>>,
    settings: PipelineSettings,
) -> Arc<Pipeline> {
    let fallback = FallbackBatcher::new(
        backend.clone(),
        FallbackSettings {
            thresholds: ConfidenceThresholds::default(),
            fields: Field::ALL.to_vec(),
            batch_size: 10,
            target_language: "en".into(),
        },
    );
    Arc::new(Pipeline::new(
        feed,
        store,
        countries(),
        fallback,
        TranslationBatcher::new(backend, "en", 10),
        settings,
    ))
}

fn start(controller: &RunController, pipeline: &Arc<Pipeline>) -> Result<(), RunError> {
    let p = Arc::clone(pipeline);
    controller.start(move |reporter| async move { p.run(&reporter).await })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_run_stores_deduplicated_records() {
    let feed = Arc::new(FixedFeed::new(vec![
        item("alpha", 1, "Protesters gathered in France against the reform"),
        item("alpha", 1, "Same key, later copy"),
        item("alpha", 2, "Protesters gathered in France against the reform"),
        item("alpha", 3, "Airstrikes reported near the border of Ukraine"),
        item("alpha", 4, "Quiet day"),
    ]));
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(feed, store.clone(), None, settings(&["alpha"], 100, 3));
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    let lines: Vec<String> = controller.stream_logs().collect().await;
    controller.join().await;

    let status = controller.status();
    assert_eq!(status.stage, RunStage::Done);
    assert_eq!(status.percent, 100);
    assert!(!status.running);
    let summary = status.summary.unwrap();
    assert_eq!(summary.fetched, 5);
    assert_eq!(summary.new_items, 4);
    assert_eq!(summary.after_content_dedupe, 3);
    assert_eq!(summary.stored, 3);

    let mut records = store.all();
    records.sort_by_key(|r| r.origin_message_id);
    let ids: Vec<i64> = records.iter().map(|r| r.origin_message_id).collect();
    assert_eq!(ids, vec![1, 3, 4]);

    assert_eq!(records[0].country_norm.as_deref(), Some("France"));
    assert_eq!(records[0].event_type.as_deref(), Some("Protest"));
    // No model backend: translation keeps the original text
    assert_eq!(records[0].translated_text.as_deref(), Some(records[0].raw_text.as_str()));

    assert_eq!(records[1].country.as_deref(), Some("Ukraine"));
    assert_eq!(records[1].country_norm, None);
    assert!(lines.iter().any(|l| l.contains("Country not georeferenced: Ukraine")));
    assert!(lines.iter().any(|l| l.contains("==> Done")));
}

#[tokio::test]
async fn test_second_run_finds_nothing_new() {
    let feed = Arc::new(FixedFeed::new(vec![item("alpha", 1, "Quiet day")]));
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(feed, store.clone(), None, settings(&["alpha"], 100, 3));
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    controller.join().await;
    start(&controller, &pipeline).unwrap();
    controller.join().await;

    let status = controller.status();
    assert_eq!(status.stage, RunStage::Done);
    let summary = status.summary.unwrap();
    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.new_items, 0);
    assert_eq!(summary.stored, 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_empty_fetch_finishes_done() {
    let feed = Arc::new(FixedFeed::new(vec![]));
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(feed, store.clone(), None, settings(&["alpha"], 100, 3));
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    controller.join().await;

    let status = controller.status();
    assert_eq!(status.stage, RunStage::Done);
    assert_eq!(status.summary.unwrap().fetched, 0);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_channel_failure_is_skipped() {
    let feed = Arc::new(
        FixedFeed::new(vec![item("alpha", 1, "Quiet day")]).failing("beta", || FeedError::Api {
            code: 502,
            message: "bad gateway".into(),
        }),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        feed.clone(),
        store.clone(),
        None,
        settings(&["beta", "alpha"], 100, 3),
    );
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    controller.join().await;

    assert_eq!(controller.status().stage, RunStage::Done);
    assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_missing_credentials_abort_run() {
    let feed = Arc::new(
        FixedFeed::new(vec![item("alpha", 1, "Quiet day")])
            .failing("alpha", || FeedError::MissingCredentials),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(feed, store.clone(), None, settings(&["alpha"], 100, 3));
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    controller.join().await;

    let status = controller.status();
    assert_eq!(status.stage, RunStage::Aborted);
    assert!(status.step.starts_with("Aborted: "));
    assert!(status.reason.is_some());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_store_retry_recovers_from_transient_failures() {
    let feed = Arc::new(FixedFeed::new(vec![
        item("alpha", 1, "First quiet day"),
        item("alpha", 2, "Second quiet day"),
    ]));
    let store = Arc::new(MemoryStore::new());
    store.fail_next_inserts(2);
    let pipeline = pipeline(feed, store.clone(), None, settings(&["alpha"], 100, 3));
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    controller.join().await;

    assert_eq!(controller.status().stage, RunStage::Done);
    assert_eq!(store.insert_calls(), 3);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_store_retry_exhaustion_keeps_earlier_chunks() {
    let feed = Arc::new(FixedFeed::new(vec![
        item("alpha", 1, "First quiet day"),
        item("alpha", 2, "Second quiet day"),
        item("alpha", 3, "Third quiet day"),
    ]));
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        ok_calls: 1,
        insert_calls: AtomicUsize::new(0),
    });
    let pipeline = pipeline(feed, store.clone(), None, settings(&["alpha"], 1, 2));
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    controller.join().await;

    let status = controller.status();
    assert_eq!(status.stage, RunStage::Aborted);
    assert!(status.step.starts_with("Aborted: "));
    // One good chunk, then the second chunk's first try plus two retries
    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 4);
    assert_eq!(store.inner.len(), 1);
}

#[tokio::test]
async fn test_cancel_during_model_call() {
    let entered = Arc::new(Notify::new());
    let backend = Arc::new(StalledBackend {
        entered: entered.clone(),
        calls: AtomicUsize::new(0),
    });
    let feed = Arc::new(FixedFeed::new(vec![item(
        "alpha",
        1,
        "Les manifestants sont dans la rue pour la grève",
    )]));
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        feed,
        store.clone(),
        Some(backend.clone()),
        settings(&["alpha"], 100, 3),
    );
    let controller = RunController::new(500);

    start(&controller, &pipeline).unwrap();
    entered.notified().await;

    assert_eq!(start(&controller, &pipeline), Err(RunError::AlreadyRunning));
    assert!(controller.is_running());

    assert!(controller.cancel());
    controller.join().await;

    let status = controller.status();
    assert_eq!(status.stage, RunStage::Cancelled);
    assert_eq!(status.step, "Cancelled");
    assert!(!status.running);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert!(store.is_empty());
}
