//! Pipeline orchestrator: Fetching → Deduping → Enriching → Translating →
//! Storing → Cleaning.
//!
//! Cancellation is checked at every stage boundary, between sub-batches and
//! between store chunks; in-flight external calls are raced against the
//! run's token. An empty fetch (or nothing new after dedupe) ends the run as
//! `Done` without a retention sweep.

use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use vigil_core::config::VigilConfig;
use vigil_core::feed::{parse_channel_specs, ChannelSpec, FeedError, FeedSource};
use vigil_core::model_client::ModelBackend;
use vigil_core::models::{NewRecord, RawItem, TranslationResult};
use vigil_core::normalize::CountryTable;
use vigil_core::store::{MessageStore, StoreError};

use super::dedupe::{collapse_batch_keys, dedupe_by_content, filter_existing};
use super::enrich::EnrichedItem;
use super::fallback::{FallbackBatcher, FallbackSettings};
use super::retention::run_retention_sweep;
use super::run_control::{Cancelled, RunOutcome, RunReporter, RunStage, RunSummary};
use super::translate::TranslationBatcher;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("run cancelled")]
    Cancelled,

    #[error("feed unavailable: {0}")]
    Feed(FeedError),

    #[error("storage failed: {0}")]
    Store(#[from] StoreError),
}

impl From<Cancelled> for PipelineError {
    fn from(_: Cancelled) -> Self {
        PipelineError::Cancelled
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub channels: Vec<ChannelSpec>,
    pub window_hours: u64,
    pub max_messages_per_channel: u32,
    pub store_chunk_size: usize,
    pub store_max_retries: usize,
    pub store_retry_delay_ms: u64,
    pub retention_days: i64,
}

impl PipelineSettings {
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            channels: parse_channel_specs(&config.feed.channels),
            window_hours: config.feed.window_hours,
            max_messages_per_channel: config.feed.max_messages_per_channel,
            store_chunk_size: config.pipeline.store_chunk_size.max(1),
            store_max_retries: config.pipeline.store_max_retries,
            store_retry_delay_ms: config.pipeline.store_retry_delay_ms,
            retention_days: config.pipeline.retention_days,
        }
    }
}

pub struct Pipeline {
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn MessageStore>,
    countries: Arc<CountryTable>,
    fallback: FallbackBatcher,
    translator: TranslationBatcher,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn MessageStore>,
        countries: Arc<CountryTable>,
        fallback: FallbackBatcher,
        translator: TranslationBatcher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            feed,
            store,
            countries,
            fallback,
            translator,
            settings,
        }
    }

    /// Wires a pipeline from config; one model backend serves both the
    /// fallback extractor and the translator.
    pub fn from_config(
        config: &VigilConfig,
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn MessageStore>,
        backend: Option<Arc<dyn ModelBackend>>,
        countries: Arc<CountryTable>,
    ) -> Self {
        Self::new(
            feed,
            store,
            countries,
            FallbackBatcher::new(backend.clone(), FallbackSettings::from_config(config)),
            TranslationBatcher::from_config(backend, config),
            PipelineSettings::from_config(config),
        )
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub async fn run(&self, reporter: &RunReporter) -> RunOutcome {
        match self.execute(reporter).await {
            Ok(summary) => RunOutcome::Done(summary),
            Err(PipelineError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => {
                reporter.warn(format!("Run aborted: {}", e));
                RunOutcome::Aborted(e.to_string())
            }
        }
    }

    async fn execute(&self, reporter: &RunReporter) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        // Fetching
        reporter.checkpoint()?;
        reporter.enter(RunStage::Fetching);
        let fetched = self.fetch(reporter).await?;
        summary.fetched = fetched.len();
        reporter.log(format!("Fetched {} messages", fetched.len()));
        if fetched.is_empty() {
            reporter.log("Nothing fetched, finishing early");
            return Ok(summary);
        }

        // Deduping
        reporter.checkpoint()?;
        reporter.enter(RunStage::Deduping);
        let collapsed = collapse_batch_keys(fetched);
        let fresh = tokio::select! {
            res = filter_existing(self.store.as_ref(), collapsed) => res?,
            _ = reporter.token().cancelled() => return Err(PipelineError::Cancelled),
        };
        summary.new_items = fresh.len();
        reporter.log(format!("{} new messages after dedupe", fresh.len()));
        if fresh.is_empty() {
            reporter.log("No new messages, finishing early");
            return Ok(summary);
        }

        // Enriching
        reporter.checkpoint()?;
        reporter.enter(RunStage::Enriching);
        let mut items: Vec<EnrichedItem> = fresh
            .into_iter()
            .map(|raw| EnrichedItem::new(raw, &self.countries))
            .collect();
        reporter.log(format!("Deterministic pass done for {} items", items.len()));

        let fallback = self.fallback.run(&mut items, reporter).await?;
        reporter.log(format!(
            "Fallback: {} items needed it, {} sub-batches ({} failed), {} fields filled",
            fallback.items_needing_fallback,
            fallback.sub_batches_sent,
            fallback.sub_batches_failed,
            fallback.fields_filled
        ));

        let before = items.len();
        let items = dedupe_by_content(items);
        summary.after_content_dedupe = items.len();
        reporter.log(format!(
            "Content dedupe removed {} items, {} remain",
            before - items.len(),
            items.len()
        ));

        // Translating
        reporter.checkpoint()?;
        reporter.enter(RunStage::Translating);
        let texts: Vec<String> = items.iter().map(|i| i.raw.text.clone()).collect();
        let (translations, translation) = self.translator.translate(&texts, reporter).await?;
        reporter.log(format!(
            "Translation: {} translated, {} kept as-is, {} failed sub-batches",
            translation.translated, translation.passthrough, translation.sub_batches_failed
        ));

        // Storing
        reporter.checkpoint()?;
        reporter.enter(RunStage::Storing);
        let records = self.build_records(items, translations, reporter);
        summary.stored = self.store_records(&records, reporter).await?;

        // Cleaning
        reporter.checkpoint()?;
        reporter.enter(RunStage::Cleaning);
        let sweep = tokio::select! {
            res = run_retention_sweep(self.store.as_ref(), self.settings.retention_days, Utc::now()) => res,
            _ = reporter.token().cancelled() => return Err(PipelineError::Cancelled),
        };
        match sweep {
            Ok(report) => {
                summary.retention_deleted = report.deleted;
                reporter.log(format!("Retention removed {} old records", report.deleted));
            }
            Err(e) => reporter.warn(format!("Retention sweep failed (non-fatal): {}", e)),
        }

        Ok(summary)
    }

    async fn fetch(
        &self,
        reporter: &RunReporter,
    ) -> Result<Vec<RawItem>, PipelineError> {
        let since = Utc::now() - Duration::hours(self.settings.window_hours as i64);
        let mut fetched = Vec::new();

        for channel in &self.settings.channels {
            reporter.checkpoint()?;
            let result = tokio::select! {
                res = self.feed.list_recent(channel, since, self.settings.max_messages_per_channel) => res,
                _ = reporter.token().cancelled() => return Err(PipelineError::Cancelled),
            };
            match result {
                Ok(items) => {
                    reporter.log(format!("Channel {}: {} messages", channel.channel, items.len()));
                    fetched.extend(items);
                }
                Err(e) if e.is_fatal() => return Err(PipelineError::Feed(e)),
                Err(e) => {
                    reporter.warn(format!("Channel {} skipped: {}", channel.channel, e));
                }
            }
        }

        Ok(fetched)
    }

    fn build_records(
        &self,
        items: Vec<EnrichedItem>,
        translations: Vec<TranslationResult>,
        reporter: &RunReporter,
    ) -> Vec<NewRecord> {
        items
            .into_iter()
            .zip(translations)
            .map(|(item, translation)| {
                let EnrichedItem { raw, resolved, .. } = item;
                let country_norm = resolved
                    .country
                    .as_deref()
                    .and_then(|c| self.countries.canonical_key(c));
                if let (Some(country), None) = (resolved.country.as_deref(), &country_norm) {
                    if !country.trim().is_empty() {
                        reporter.log(format!("Country not georeferenced: {}", country));
                    }
                }

                NewRecord {
                    source: raw.source,
                    channel: raw.channel,
                    origin_message_id: raw.origin_message_id,
                    raw_text: raw.text,
                    translated_text: Some(translation.translated_text),
                    country: resolved.country,
                    country_norm,
                    region: resolved.region,
                    location: resolved.location,
                    title: resolved.title,
                    event_type: resolved.event_category.map(|c| c.as_str().to_string()),
                    orientation: Some(raw.orientation),
                    label: raw.label,
                    event_timestamp: Some(raw.timestamp),
                }
            })
            .collect()
    }

    /// Inserts `records` chunk by chunk; each chunk is retried on transient
    /// errors. Chunks committed before a failure stay committed.
    async fn store_records(
        &self,
        records: &[NewRecord],
        reporter: &RunReporter,
    ) -> Result<usize, PipelineError> {
        let chunk_size = self.settings.store_chunk_size;
        let total_chunks = records.len().div_ceil(chunk_size);
        let mut stored = 0;

        for (chunk_no, chunk) in records.chunks(chunk_size).enumerate() {
            reporter.checkpoint()?;

            let strategy = ExponentialBackoff::from_millis(self.settings.store_retry_delay_ms.max(1))
                .max_delay(std::time::Duration::from_secs(5))
                .map(jitter)
                .take(self.settings.store_max_retries);

            let store = self.store.as_ref();
            let insert = RetryIf::spawn(
                strategy,
                move || async move {
                    let res = store.insert_batch(chunk).await;
                    if let Err(e) = &res {
                        tracing::warn!(chunk = chunk_no + 1, error = %e, "Store chunk attempt failed");
                    }
                    res
                },
                |e: &StoreError| e.is_transient(),
            );

            let inserted = tokio::select! {
                res = insert => res.map_err(|e| {
                    reporter.warn(format!(
                        "Chunk {}/{} failed after retries: {}",
                        chunk_no + 1,
                        total_chunks,
                        e
                    ));
                    PipelineError::Store(e)
                })?,
                _ = reporter.token().cancelled() => return Err(PipelineError::Cancelled),
            };

            stored += inserted;
            reporter.log(format!(
                "Stored chunk {}/{}: {} of {} inserted",
                chunk_no + 1,
                total_chunks,
                inserted,
                chunk.len()
            ));
        }

        Ok(stored)
    }
}
