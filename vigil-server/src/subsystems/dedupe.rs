//! Duplicate suppression at three points of a run:
//! - within one fetch, by natural key
//! - against the store, by natural key
//! - after enrichment, by content (title when present, else text)

use std::collections::HashSet;

use vigil_core::models::{MessageKey, RawItem};
use vigil_core::store::{MessageStore, StoreError};

use super::enrich::EnrichedItem;

/// Keeps the first item for each `(channel, origin_message_id)`.
pub fn collapse_batch_keys(items: Vec<RawItem>) -> Vec<RawItem> {
    let mut seen: HashSet<MessageKey> = HashSet::with_capacity(items.len());
    items.into_iter().filter(|i| seen.insert(i.key())).collect()
}

/// Drops items whose natural key is already stored.
pub async fn filter_existing(
    store: &dyn MessageStore,
    items: Vec<RawItem>,
) -> Result<Vec<RawItem>, StoreError> {
    if items.is_empty() {
        return Ok(items);
    }
    let keys: Vec<MessageKey> = items.iter().map(RawItem::key).collect();
    let existing = store.existing_keys(&keys).await?;
    Ok(items
        .into_iter()
        .filter(|i| !existing.contains(&i.key()))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKey {
    Title {
        source: String,
        channel: String,
        country: Option<String>,
        title: String,
    },
    Text {
        source: String,
        channel: String,
        country: Option<String>,
        text: String,
    },
}

pub fn content_key(item: &EnrichedItem) -> ContentKey {
    let source = item.raw.source.clone();
    let channel = item.raw.channel.clone();
    let country = item.resolved.country.clone();
    match item.resolved.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => ContentKey::Title {
            source,
            channel,
            country,
            title: title.to_string(),
        },
        _ => ContentKey::Text {
            source,
            channel,
            country,
            text: item.deterministic.normalized_text.clone(),
        },
    }
}

/// First item per content key wins, arrival order preserved.
pub fn dedupe_by_content(items: Vec<EnrichedItem>) -> Vec<EnrichedItem> {
    let mut seen: HashSet<ContentKey> = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(content_key(item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::normalize::CountryTable;
    use vigil_core::store::MemoryStore;
    use vigil_core::models::NewRecord;

    fn raw(channel: &str, id: i64, text: &str) -> RawItem {
        RawItem {
            source: "Alpha".into(),
            channel: channel.into(),
            origin_message_id: id,
            orientation: "unknown".into(),
            label: None,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    fn enriched(id: i64, text: &str, title: Option<&str>) -> EnrichedItem {
        let mut item = EnrichedItem::new(raw("alpha", id, text), &CountryTable::default());
        item.resolved.title = title.map(str::to_string);
        item
    }

    #[test]
    fn test_collapse_keeps_first() {
        let items = vec![raw("a", 1, "first"), raw("a", 1, "second"), raw("b", 1, "other")];
        let out = collapse_batch_keys(items);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "first");
    }

    #[tokio::test]
    async fn test_filter_existing_is_idempotent() {
        let store = MemoryStore::new();
        store
            .insert_batch(&[NewRecord {
                source: "Alpha".into(),
                channel: "a".into(),
                origin_message_id: 1,
                raw_text: "stored".into(),
                translated_text: None,
                country: None,
                country_norm: None,
                region: None,
                location: None,
                title: None,
                event_type: None,
                orientation: None,
                label: None,
                event_timestamp: None,
            }])
            .await
            .unwrap();

        let items = vec![raw("a", 1, "dup"), raw("a", 2, "new")];
        let once = filter_existing(&store, items).await.unwrap();
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].origin_message_id, 2);

        let twice = filter_existing(&store, once.clone()).await.unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn test_content_dedupe_by_title_then_text() {
        let items = vec![
            enriched(1, "Text one", Some("Same headline")),
            enriched(2, "Text two", Some("Same headline")),
            enriched(3, "Repeated   body", None),
            enriched(4, "Repeated body", None),
            enriched(5, "Repeated body", Some("   ")),
            enriched(6, "Unique", None),
        ];
        let out = dedupe_by_content(items);
        let ids: Vec<i64> = out.iter().map(|i| i.raw.origin_message_id).collect();
        assert_eq!(ids, vec![1, 3, 6]);
    }
}
