use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessageKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRecord {
    pub id: Uuid,
    pub source: String,
    pub channel: String,
    pub origin_message_id: i64,
    pub raw_text: String,
    pub translated_text: Option<String>,
    pub country: Option<String>,
    pub country_norm: Option<String>,
    pub region: Option<String>,
    pub location: Option<String>,
    pub title: Option<String>,
    pub event_type: Option<String>,
    pub orientation: Option<String>,
    pub label: Option<String>,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel.clone(),
            origin_message_id: self.origin_message_id,
        }
    }

    /// Columns free-text search looks at.
    pub fn searchable_fields(&self) -> [Option<&str>; 8] {
        [
            self.translated_text.as_deref(),
            self.country.as_deref(),
            self.country_norm.as_deref(),
            self.region.as_deref(),
            self.location.as_deref(),
            self.label.as_deref(),
            self.event_type.as_deref(),
            Some(self.source.as_str()),
        ]
    }
}

/// A record ready to be inserted; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub source: String,
    pub channel: String,
    pub origin_message_id: i64,
    pub raw_text: String,
    pub translated_text: Option<String>,
    pub country: Option<String>,
    pub country_norm: Option<String>,
    pub region: Option<String>,
    pub location: Option<String>,
    pub title: Option<String>,
    pub event_type: Option<String>,
    pub orientation: Option<String>,
    pub label: Option<String>,
    pub event_timestamp: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel.clone(),
            origin_message_id: self.origin_message_id,
        }
    }

    /// Same columns, same order as [`StoredRecord::searchable_fields`].
    pub fn searchable_fields(&self) -> [Option<&str>; 8] {
        [
            self.translated_text.as_deref(),
            self.country.as_deref(),
            self.country_norm.as_deref(),
            self.region.as_deref(),
            self.location.as_deref(),
            self.label.as_deref(),
            self.event_type.as_deref(),
            Some(self.source.as_str()),
        ]
    }

    pub fn into_stored(self, id: Uuid, created_at: DateTime<Utc>) -> StoredRecord {
        StoredRecord {
            id,
            source: self.source,
            channel: self.channel,
            origin_message_id: self.origin_message_id,
            raw_text: self.raw_text,
            translated_text: self.translated_text,
            country: self.country,
            country_norm: self.country_norm,
            region: self.region,
            location: self.location,
            title: self.title,
            event_type: self.event_type,
            orientation: self.orientation,
            label: self.label,
            event_timestamp: self.event_timestamp,
            created_at,
        }
    }
}
