use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A report as produced by the feed source, before any enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source: String,
    pub channel: String,
    pub origin_message_id: i64,
    pub orientation: String,
    pub label: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl RawItem {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel.clone(),
            origin_message_id: self.origin_message_id,
        }
    }
}

/// Natural key of a stored report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel: String,
    pub origin_message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub translated_text: String,
}

impl TranslationResult {
    pub fn passthrough(text: &str) -> Self {
        Self {
            translated_text: text.to_string(),
        }
    }
}
