use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::models::Field;

#[derive(Debug, Deserialize, Clone)]
pub struct VigilConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub feed: FeedConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub countries: CountriesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    /// Comma-separated `channel[:label]` list.
    pub channels: String,
    pub window_hours: u64,
    pub max_messages_per_channel: u32,
    #[serde(default = "default_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfidenceThresholds {
    pub country: f32,
    pub region: f32,
    pub location: f32,
    pub title: f32,
    pub event_type: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            country: 0.9,
            region: 0.9,
            location: 0.9,
            title: 0.9,
            event_type: 0.85,
        }
    }
}

impl ConfidenceThresholds {
    pub fn for_field(&self, field: Field) -> f32 {
        match field {
            Field::Country => self.country,
            Field::Region => self.region,
            Field::Location => self.location,
            Field::Title => self.title,
            Field::EventType => self.event_type,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    pub batch_size: usize,
    #[serde(default)]
    pub thresholds: ConfidenceThresholds,
    #[serde(default = "default_fallback_fields")]
    pub fallback_fields: Vec<Field>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            thresholds: ConfidenceThresholds::default(),
            fallback_fields: default_fallback_fields(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranslationConfig {
    pub target_language: String,
    pub batch_size: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_language: "fr".to_string(),
            batch_size: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub log_capacity: usize,
    pub retention_days: i64,
    pub store_chunk_size: usize,
    pub store_max_retries: usize,
    pub store_retry_delay_ms: u64,
    /// 0 disables scheduled runs.
    pub schedule_interval_minutes: u64,
    pub permalink_base: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_capacity: 500,
            retention_days: 10,
            store_chunk_size: 100,
            store_max_retries: 3,
            store_retry_delay_ms: 200,
            schedule_interval_minutes: 0,
            permalink_base: "https://t.me".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CountriesConfig {
    /// Overrides the bundled alias/coordinate table when set.
    pub path: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_fallback_fields() -> Vec<Field> {
    Field::ALL.to_vec()
}

impl VigilConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("VIGIL").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
