//! Record storage contract plus PostgreSQL and in-memory adapters.
//!
//! `(channel, origin_message_id)` is unique in both adapters. Inserting a
//! colliding record is a silent skip, not an error.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{MessageKey, NewRecord, StoredRecord};
use crate::normalize::fold_for_search;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Store state poisoned")]
    Poisoned,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Poisoned | StoreError::InvalidArgument(_) => false,
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    Some("40001") | Some("40P01") | Some("55P03") | Some("57P01")
                ) || db.code().is_some_and(|c| c.starts_with("08")),
                _ => false,
            },
        }
    }
}

/// Which records a query covers with respect to the country columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CountryScope {
    #[default]
    Any,
    /// `country_norm` equals the key.
    Canonical(String),
    /// Any non-null `country_norm`.
    Resolved,
    /// `country_norm` null while the raw country is non-empty.
    Unresolved,
    /// Raw country null or empty.
    Unassigned,
}

/// Conjunction of optional predicates. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub country: CountryScope,
    /// Inclusive `event_timestamp` ranges, OR-ed together.
    pub event_ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    pub event_since: Option<DateTime<Utc>>,
    pub require_event_timestamp: bool,
    /// Inclusive `created_at` range.
    pub created_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub sources: Vec<String>,
    pub labels: Vec<String>,
    pub event_types: Vec<String>,
    pub require_translation: bool,
    /// Already-folded needle (see [`fold_for_search`]) that must occur in
    /// one of the searchable columns.
    pub text_contains: Option<String>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        let raw_country = record
            .country
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let country_ok = match &self.country {
            CountryScope::Any => true,
            CountryScope::Canonical(key) => record.country_norm.as_deref() == Some(key.as_str()),
            CountryScope::Resolved => record.country_norm.is_some(),
            CountryScope::Unresolved => record.country_norm.is_none() && raw_country.is_some(),
            CountryScope::Unassigned => raw_country.is_none(),
        };
        if !country_ok {
            return false;
        }

        let ts = record.event_timestamp;
        if self.require_event_timestamp && ts.is_none() {
            return false;
        }
        if let Some(since) = self.event_since {
            if !ts.is_some_and(|t| t >= since) {
                return false;
            }
        }
        if !self.event_ranges.is_empty()
            && !ts.is_some_and(|t| self.event_ranges.iter().any(|(a, b)| t >= *a && t <= *b))
        {
            return false;
        }

        if let Some((start, end)) = self.created_between {
            if record.created_at < start || record.created_at > end {
                return false;
            }
        }

        if !in_list(&self.sources, Some(&record.source))
            || !in_list(&self.labels, record.label.as_ref())
            || !in_list(&self.event_types, record.event_type.as_ref())
        {
            return false;
        }

        if self.require_translation && record.translated_text.is_none() {
            return false;
        }

        match self.text_contains.as_deref() {
            Some(needle) => record
                .searchable_fields()
                .into_iter()
                .flatten()
                .any(|v| fold_for_search(v).contains(needle)),
            None => true,
        }
    }
}

/// Folded searchable columns, one per line.
fn search_document(fields: [Option<&str>; 8]) -> String {
    fields
        .into_iter()
        .flatten()
        .map(fold_for_search)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn in_list(list: &[String], value: Option<&String>) -> bool {
    list.is_empty() || value.is_some_and(|v| list.contains(v))
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Subset of `keys` already present.
    async fn existing_keys(&self, keys: &[MessageKey]) -> Result<HashSet<MessageKey>, StoreError>;

    /// Inserts all records atomically, skipping key collisions. Returns the
    /// number actually inserted.
    async fn insert_batch(&self, records: &[NewRecord]) -> Result<usize, StoreError>;

    /// Matching records, newest `created_at` first.
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError>;

    /// Distinct non-empty sources, sorted.
    async fn distinct_sources(&self) -> Result<Vec<String>, StoreError>;

    /// Up to `limit` distinct UTC dates of `created_at`, newest first.
    async fn recent_created_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError>;

    /// Deletes records whose event timestamp is before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn health(&self) -> Result<String, StoreError>;

    fn name(&self) -> &str;
}

// ============================================================================
// PostgreSQL
// ============================================================================

const SELECT_COLUMNS: &str = "SELECT id, source, channel, origin_message_id, raw_text, \
     translated_text, country, country_norm, region, location, title, event_type, \
     orientation, label, event_timestamp, created_at FROM messages";

#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RecordFilter) {
    qb.push(" WHERE TRUE");

    match &filter.country {
        CountryScope::Any => {}
        CountryScope::Canonical(key) => {
            qb.push(" AND country_norm = ").push_bind(key.clone());
        }
        CountryScope::Resolved => {
            qb.push(" AND country_norm IS NOT NULL");
        }
        CountryScope::Unresolved => {
            qb.push(" AND country_norm IS NULL AND COALESCE(TRIM(country), '') <> ''");
        }
        CountryScope::Unassigned => {
            qb.push(" AND COALESCE(TRIM(country), '') = ''");
        }
    }

    if filter.require_event_timestamp {
        qb.push(" AND event_timestamp IS NOT NULL");
    }
    if let Some(since) = filter.event_since {
        qb.push(" AND event_timestamp >= ").push_bind(since);
    }
    if !filter.event_ranges.is_empty() {
        qb.push(" AND (");
        for (i, (start, end)) in filter.event_ranges.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("(event_timestamp >= ")
                .push_bind(*start)
                .push(" AND event_timestamp <= ")
                .push_bind(*end)
                .push(")");
        }
        qb.push(")");
    }
    if let Some((start, end)) = filter.created_between {
        qb.push(" AND created_at >= ")
            .push_bind(start)
            .push(" AND created_at <= ")
            .push_bind(end);
    }
    if !filter.sources.is_empty() {
        qb.push(" AND source = ANY(").push_bind(filter.sources.clone()).push(")");
    }
    if !filter.labels.is_empty() {
        qb.push(" AND label = ANY(").push_bind(filter.labels.clone()).push(")");
    }
    if !filter.event_types.is_empty() {
        qb.push(" AND event_type = ANY(")
            .push_bind(filter.event_types.clone())
            .push(")");
    }
    if filter.require_translation {
        qb.push(" AND translated_text IS NOT NULL");
    }
    if let Some(needle) = &filter.text_contains {
        // Rows written before search_text existed fall back to an
        // accent-sensitive match.
        let pattern = format!("%{}%", escape_like(needle));
        qb.push(" AND (search_text LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR (search_text IS NULL AND concat_ws(E'\\n', translated_text, \
                 country, country_norm, region, location, label, event_type, source) ILIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\'))");
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn existing_keys(&self, keys: &[MessageKey]) -> Result<HashSet<MessageKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let channels: Vec<String> = keys.iter().map(|k| k.channel.clone()).collect();
        let ids: Vec<i64> = keys.iter().map(|k| k.origin_message_id).collect();

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT channel, origin_message_id FROM messages \
             JOIN UNNEST($1::text[], $2::bigint[]) AS k(channel, origin_message_id) \
             USING (channel, origin_message_id)",
        )
        .bind(&channels)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(channel, origin_message_id)| MessageKey {
                channel,
                origin_message_id,
            })
            .collect())
    }

    async fn insert_batch(&self, records: &[NewRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO messages (source, channel, origin_message_id, raw_text, \
             translated_text, country, country_norm, region, location, title, event_type, \
             orientation, label, event_timestamp, search_text) ",
        );
        qb.push_values(records, |mut b, r| {
            b.push_bind(r.source.clone())
                .push_bind(r.channel.clone())
                .push_bind(r.origin_message_id)
                .push_bind(r.raw_text.clone())
                .push_bind(r.translated_text.clone())
                .push_bind(r.country.clone())
                .push_bind(r.country_norm.clone())
                .push_bind(r.region.clone())
                .push_bind(r.location.clone())
                .push_bind(r.title.clone())
                .push_bind(r.event_type.clone())
                .push_bind(r.orientation.clone())
                .push_bind(r.label.clone())
                .push_bind(r.event_timestamp)
                .push_bind(search_document(r.searchable_fields()));
        });
        qb.push(" ON CONFLICT (channel, origin_message_id) DO NOTHING");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build_query_as::<StoredRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn distinct_sources(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT source FROM messages WHERE source <> '' ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn recent_created_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError> {
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(
            "SELECT DISTINCT (created_at AT TIME ZONE 'UTC')::date AS day FROM messages \
             ORDER BY day DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE event_timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health(&self) -> Result<String, StoreError> {
        Ok(crate::db::health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    records: Vec<StoredRecord>,
    keys: HashSet<MessageKey>,
}

/// Process-local store with the same uniqueness rules as the database.
/// `fail_next_inserts` makes the next N insert calls fail transiently.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    failures_pending: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds records as-is, skipping key collisions.
    pub fn seed(&self, records: Vec<StoredRecord>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        for record in records {
            if inner.keys.insert(record.key()) {
                inner.records.push(record);
            }
        }
        Ok(())
    }

    pub fn fail_next_inserts(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<StoredRecord> {
        self.inner
            .lock()
            .map(|i| i.records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn existing_keys(&self, keys: &[MessageKey]) -> Result<HashSet<MessageKey>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(keys
            .iter()
            .filter(|k| inner.keys.contains(*k))
            .cloned()
            .collect())
    }

    async fn insert_batch(&self, records: &[NewRecord]) -> Result<usize, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let pending = self.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_pending.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now();
        let mut inserted = 0;
        for record in records {
            if inner.keys.insert(record.key()) {
                inner
                    .records
                    .push(record.clone().into_stored(Uuid::new_v4(), now));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let mut rows: Vec<StoredRecord> = inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn distinct_sources(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let sources: BTreeSet<&str> = inner
            .records
            .iter()
            .map(|r| r.source.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        Ok(sources.into_iter().map(str::to_string).collect())
    }

    async fn recent_created_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let dates: BTreeSet<NaiveDate> =
            inner.records.iter().map(|r| r.created_at.date_naive()).collect();
        Ok(dates.into_iter().rev().take(limit).collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let before = inner.records.len();
        inner
            .records
            .retain(|r| !r.event_timestamp.is_some_and(|t| t < cutoff));
        let removed = before - inner.records.len();
        if removed > 0 {
            inner.keys = inner.records.iter().map(StoredRecord::key).collect();
        }
        Ok(removed as u64)
    }

    async fn health(&self) -> Result<String, StoreError> {
        Ok(format!("memory store, {} records", self.len()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
