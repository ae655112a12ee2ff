//! Retention sweep: drops records whose event timestamp is older than the
//! configured age. Records without an event timestamp are kept.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use vigil_core::store::{MessageStore, StoreError};

/// Report from a retention sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub cutoff: DateTime<Utc>,
    pub deleted: u64,
    pub elapsed_ms: u64,
}

/// `now - max_age_days`, or `None` when the age is negative or the
/// subtraction leaves chrono's range.
pub fn retention_cutoff(now: DateTime<Utc>, max_age_days: i64) -> Option<DateTime<Utc>> {
    if max_age_days < 0 {
        return None;
    }
    TimeDelta::try_days(max_age_days).and_then(|age| now.checked_sub_signed(age))
}

/// Deletes every record older than `now - max_age_days`.
pub async fn run_retention_sweep(
    store: &dyn MessageStore,
    max_age_days: i64,
    now: DateTime<Utc>,
) -> Result<RetentionReport, StoreError> {
    let start = std::time::Instant::now();
    let cutoff = retention_cutoff(now, max_age_days).ok_or_else(|| {
        StoreError::InvalidArgument(format!("max_age_days out of range: {}", max_age_days))
    })?;
    let deleted = store.delete_older_than(cutoff).await?;

    let report = RetentionReport {
        cutoff,
        deleted,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    tracing::info!(
        "Retention sweep complete: {} records older than {} deleted in {}ms",
        report.deleted,
        report.cutoff,
        report.elapsed_ms
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use vigil_core::models::NewRecord;
    use vigil_core::store::MemoryStore;

    fn record(id: i64, ts: Option<DateTime<Utc>>) -> NewRecord {
        NewRecord {
            source: "Alpha".into(),
            channel: "alpha".into(),
            origin_message_id: id,
            raw_text: "text".into(),
            translated_text: None,
            country: None,
            country_norm: None,
            region: None,
            location: None,
            title: None,
            event_type: None,
            orientation: None,
            label: None,
            event_timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_older_records() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        let store = MemoryStore::new();
        store
            .insert_batch(&[
                record(1, Some(now - Duration::days(11))),
                record(2, Some(now - Duration::days(10) + Duration::seconds(1))),
                record(3, Some(now - Duration::days(1))),
                record(4, None),
            ])
            .await
            .unwrap();

        let report = run_retention_sweep(&store, 10, now).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.cutoff, now - Duration::days(10));
        let remaining: Vec<i64> = store.all().iter().map(|r| r.origin_message_id).collect();
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_sweep_rejects_out_of_range_age() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        let store = MemoryStore::new();
        store.insert_batch(&[record(1, Some(now - Duration::days(400)))]).await.unwrap();

        for days in [-1, i64::MAX, i64::MIN] {
            let err = run_retention_sweep(&store, days, now).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)), "{days}: {err}");
            assert!(!err.is_transient());
        }
        assert_eq!(store.all().len(), 1);
        assert_eq!(retention_cutoff(now, 0), Some(now));
    }

    #[tokio::test]
    async fn test_sweep_on_empty_store() {
        let store = MemoryStore::new();
        let report = run_retention_sweep(&store, 10, Utc::now()).await.unwrap();
        assert_eq!(report.deleted, 0);
    }
}
