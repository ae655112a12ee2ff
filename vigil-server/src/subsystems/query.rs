//! Read-side aggregation over stored records.
//!
//! Everything country-related keys on `country_norm`; the raw `country`
//! column only feeds the `ignored` list, the non-georeferenced view and the
//! per-raw-name activity counts. Day windows are UTC calendar days on the
//! event timestamp, except the facet and date listings which follow the
//! ingestion timestamp.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use vigil_core::ipc::QueryFilters;
use vigil_core::models::StoredRecord;
use vigil_core::normalize::{fold_for_search, CountryTable};
use vigil_core::store::{CountryScope, MessageStore, RecordFilter, StoreError};

const PREVIEW_MAX_CHARS: usize = 280;
const SEARCH_LIMIT: usize = 100;
const AVAILABLE_DATES_LIMIT: usize = 10;
pub const UNASSIGNED_LABEL: &str = "Unassigned";

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityWindow {
    /// Union of whole UTC days.
    Dates(Vec<NaiveDate>),
    TrailingDays(i64),
    AllTime,
}

impl ActivityWindow {
    /// Explicit dates win over a day count; neither means all time.
    pub fn from_request(dates: Vec<NaiveDate>, days: Option<i64>) -> Self {
        match (dates.is_empty(), days) {
            (false, _) => ActivityWindow::Dates(dates),
            (true, Some(d)) => ActivityWindow::TrailingDays(d),
            (true, None) => ActivityWindow::AllTime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryStatus {
    pub country: String,
    pub events_count: usize,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCountries {
    pub countries: Vec<CountryStatus>,
    pub ignored_countries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventMessage {
    pub id: Uuid,
    pub origin_message_id: i64,
    pub channel: String,
    pub title: Option<String>,
    pub source: String,
    pub orientation: Option<String>,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub url: Option<String>,
    pub text: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneEvents {
    pub region: Option<String>,
    pub location: Option<String>,
    pub messages_count: usize,
    pub messages: Vec<EventMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryEvents {
    pub date: NaiveDate,
    pub country: String,
    pub zones: Vec<ZoneEvents>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryActivity {
    pub country: String,
    pub events_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub source: String,
    pub country: Option<String>,
    pub country_norm: Option<String>,
    pub region: Option<String>,
    pub location: Option<String>,
    pub title: Option<String>,
    pub event_type: Option<String>,
    pub label: Option<String>,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountryFacets {
    pub sources: Vec<String>,
    pub labels: Vec<String>,
    pub event_types: Vec<String>,
}

/// Inclusive bounds of a UTC calendar day.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    (start, start + Duration::days(1) - Duration::nanoseconds(1))
}

/// Translated text, else raw text, trimmed.
pub fn display_text(record: &StoredRecord) -> String {
    record
        .translated_text
        .as_deref()
        .filter(|t| !t.is_empty())
        .or(Some(record.raw_text.as_str()).filter(|t| !t.is_empty()))
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Whole text up to 280 characters, else the first 277 plus `...`.
pub fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_MAX_CHARS {
        let head: String = text.chars().take(PREVIEW_MAX_CHARS - 3).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

pub struct QueryService {
    store: Arc<dyn MessageStore>,
    countries: Arc<CountryTable>,
    permalink_base: String,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        countries: Arc<CountryTable>,
        permalink_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            countries,
            permalink_base: permalink_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn base_filter(scope: CountryScope, filters: &QueryFilters) -> RecordFilter {
        RecordFilter {
            country: scope,
            sources: filters.sources.clone(),
            labels: filters.labels.clone(),
            event_types: filters.event_types.clone(),
            ..Default::default()
        }
    }

    fn apply_window(filter: &mut RecordFilter, window: &ActivityWindow) -> Result<(), QueryError> {
        match window {
            ActivityWindow::Dates(dates) => {
                filter.event_ranges = dates.iter().map(|d| day_bounds(*d)).collect();
            }
            ActivityWindow::TrailingDays(days) => {
                let since = (*days >= 0)
                    .then(|| TimeDelta::try_days(*days))
                    .flatten()
                    .and_then(|span| Utc::now().checked_sub_signed(span))
                    .ok_or_else(|| {
                        QueryError::InvalidQuery(format!("days out of range: {}", days))
                    })?;
                filter.event_since = Some(since);
            }
            ActivityWindow::AllTime => {
                filter.require_event_timestamp = true;
            }
        }
        Ok(())
    }

    fn ensure_known(&self, country: &str) -> Result<(), QueryError> {
        if country.is_empty() || !self.countries.is_known(country) {
            return Err(QueryError::NotFound(format!(
                "country '{}' is not normalized or has no coordinates",
                country
            )));
        }
        Ok(())
    }

    pub async fn active_countries(
        &self,
        window: &ActivityWindow,
        filters: &QueryFilters,
    ) -> Result<ActiveCountries, QueryError> {
        let mut resolved = Self::base_filter(CountryScope::Resolved, filters);
        Self::apply_window(&mut resolved, window)?;
        let mut unresolved = Self::base_filter(CountryScope::Unresolved, filters);
        Self::apply_window(&mut unresolved, window)?;

        let mut stats: HashMap<String, (usize, Option<DateTime<Utc>>)> = HashMap::new();
        for record in self.store.query(&resolved).await? {
            let Some(key) = record.country_norm else {
                continue;
            };
            if !self.countries.is_known(&key) {
                continue;
            }
            let entry = stats.entry(key).or_insert((0, None));
            entry.0 += 1;
            if record.event_timestamp > entry.1 {
                entry.1 = record.event_timestamp;
            }
        }

        let mut countries: Vec<CountryStatus> = stats
            .into_iter()
            .map(|(country, (events_count, last))| CountryStatus {
                country,
                events_count,
                last_date: last.map(|t| t.date_naive()),
            })
            .collect();
        countries.sort_by(|a, b| {
            b.events_count
                .cmp(&a.events_count)
                .then_with(|| a.country.cmp(&b.country))
        });

        let mut ignored: BTreeSet<String> = BTreeSet::new();
        for record in self.store.query(&unresolved).await? {
            let Some(raw) = record.country.as_deref().map(str::trim) else {
                continue;
            };
            if raw.is_empty() || raw.chars().count() == 1 {
                continue;
            }
            match self.countries.normalize_names(raw).first() {
                Some(canonical) => ignored.insert(format!("{} → {}", raw, canonical)),
                None => ignored.insert(raw.to_string()),
            };
        }

        Ok(ActiveCountries {
            countries,
            ignored_countries: ignored.into_iter().collect(),
        })
    }

    pub async fn country_events(
        &self,
        country: &str,
        date: Option<NaiveDate>,
        filters: &QueryFilters,
    ) -> Result<CountryEvents, QueryError> {
        self.ensure_known(country)?;
        let mut filter = Self::base_filter(CountryScope::Canonical(country.to_string()), filters);
        if let Some(d) = date {
            filter.event_ranges = vec![day_bounds(d)];
        }
        let records = self.store.query(&filter).await?;
        Ok(self.bucket(country, date, records))
    }

    pub async fn latest_country_events(
        &self,
        country: &str,
        filters: &QueryFilters,
    ) -> Result<CountryEvents, QueryError> {
        self.ensure_known(country)?;
        let mut filter = Self::base_filter(CountryScope::Canonical(country.to_string()), filters);
        filter.require_event_timestamp = true;

        let latest = self
            .store
            .query(&filter)
            .await?
            .into_iter()
            .filter_map(|r| r.event_timestamp)
            .max()
            .ok_or_else(|| QueryError::NotFound(format!("no events for '{}'", country)))?;

        self.country_events(country, Some(latest.date_naive()), filters)
            .await
    }

    pub async fn non_georef_events(
        &self,
        date: Option<NaiveDate>,
        filters: &QueryFilters,
    ) -> Result<CountryEvents, QueryError> {
        let mut filter = Self::base_filter(CountryScope::Unassigned, filters);
        if let Some(d) = date {
            filter.event_ranges = vec![day_bounds(d)];
        }
        let records = self.store.query(&filter).await?;
        Ok(self.bucket(UNASSIGNED_LABEL, date, records))
    }

    /// Events per raw country name on `date`.
    pub async fn countries_activity(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<CountryActivity>, QueryError> {
        let filter = RecordFilter {
            event_ranges: vec![day_bounds(date)],
            ..Default::default()
        };
        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in self.store.query(&filter).await? {
            if let Some(raw) = record.country.as_deref().map(str::trim) {
                if !raw.is_empty() {
                    *counts.entry(raw.to_string()).or_insert(0) += 1;
                }
            }
        }

        let mut activity: Vec<CountryActivity> = counts
            .into_iter()
            .map(|(country, events_count)| CountryActivity {
                country,
                events_count,
            })
            .collect();
        activity.sort_by(|a, b| {
            b.events_count
                .cmp(&a.events_count)
                .then_with(|| a.country.cmp(&b.country))
        });
        Ok(activity)
    }

    /// Accent- and case-insensitive substring match over translated text and
    /// the descriptive columns. Only translated records are searched.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, QueryError> {
        let needle = fold_for_search(query);
        if needle.is_empty() {
            return Err(QueryError::InvalidQuery("empty search query".to_string()));
        }

        let filter = RecordFilter {
            require_translation: true,
            text_contains: Some(needle),
            limit: Some(SEARCH_LIMIT),
            ..Default::default()
        };
        let hits = self
            .store
            .query(&filter)
            .await?
            .into_iter()
            .map(|r| SearchHit {
                preview: preview(&display_text(&r)),
                id: r.id,
                source: r.source,
                country: r.country,
                country_norm: r.country_norm,
                region: r.region,
                location: r.location,
                title: r.title,
                event_type: r.event_type,
                label: r.label,
                event_timestamp: r.event_timestamp,
            })
            .collect();
        Ok(hits)
    }

    /// Most recent distinct ingestion dates, newest first.
    pub async fn available_dates(&self) -> Result<Vec<NaiveDate>, QueryError> {
        Ok(self.store.recent_created_dates(AVAILABLE_DATES_LIMIT).await?)
    }

    pub async fn sources(&self) -> Result<Vec<String>, QueryError> {
        Ok(self.store.distinct_sources().await?)
    }

    /// Distinct sources, labels and event types for a country, optionally
    /// limited to one ingestion day.
    pub async fn country_facets(
        &self,
        country: &str,
        date: Option<NaiveDate>,
    ) -> Result<CountryFacets, QueryError> {
        self.ensure_known(country)?;
        let filter = RecordFilter {
            country: CountryScope::Canonical(country.to_string()),
            created_between: date.map(day_bounds),
            ..Default::default()
        };

        let mut sources = BTreeSet::new();
        let mut labels = BTreeSet::new();
        let mut event_types = BTreeSet::new();
        for record in self.store.query(&filter).await? {
            if !record.source.is_empty() {
                sources.insert(record.source);
            }
            labels.extend(record.label.filter(|l| !l.is_empty()));
            event_types.extend(record.event_type.filter(|e| !e.is_empty()));
        }

        Ok(CountryFacets {
            sources: sources.into_iter().collect(),
            labels: labels.into_iter().collect(),
            event_types: event_types.into_iter().collect(),
        })
    }

    fn permalink(&self, record: &StoredRecord) -> Option<String> {
        if record.channel.is_empty() || record.origin_message_id == 0 {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            self.permalink_base, record.channel, record.origin_message_id
        ))
    }

    fn bucket(
        &self,
        country: &str,
        date: Option<NaiveDate>,
        records: Vec<StoredRecord>,
    ) -> CountryEvents {
        let date = date
            .or_else(|| records.iter().map(|r| r.created_at).max().map(|t| t.date_naive()))
            .unwrap_or_else(|| Utc::now().date_naive());

        let mut order: Vec<(Option<String>, Option<String>)> = Vec::new();
        let mut buckets: HashMap<(Option<String>, Option<String>), Vec<EventMessage>> =
            HashMap::new();

        for record in records {
            let key = (record.region.clone(), record.location.clone());
            let text = display_text(&record);
            let message = EventMessage {
                url: self.permalink(&record),
                preview: preview(&text),
                text,
                id: record.id,
                origin_message_id: record.origin_message_id,
                channel: record.channel,
                title: record.title,
                source: record.source,
                orientation: record.orientation,
                event_timestamp: record.event_timestamp,
                created_at: record.created_at,
            };
            buckets
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(message);
        }

        let mut zones: Vec<ZoneEvents> = order
            .into_iter()
            .filter_map(|key| {
                let messages = buckets.remove(&key)?;
                Some(ZoneEvents {
                    region: key.0,
                    location: key.1,
                    messages_count: messages.len(),
                    messages,
                })
            })
            .collect();
        // Stable: zones with equal counts keep first-seen order.
        zones.sort_by(|a, b| b.messages_count.cmp(&a.messages_count));

        CountryEvents {
            date,
            country: country.to_string(),
            zones,
        }
    }
}
