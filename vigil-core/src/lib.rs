pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod ipc;
pub mod model_client;
pub mod models;
pub mod normalize;
pub mod store;

pub use config::VigilConfig;
pub use error::VigilError;
pub use feed::{parse_channel_specs, ChannelSpec, FeedError, FeedSource, HttpFeedSource};
pub use ipc::{QueryFilters, VigilRequest, VigilResponse};
pub use model_client::{
    create_backend, ModelBackend, ModelClientConfig, ModelError, OpenAiResponsesClient,
};
pub use normalize::{
    canonical_country_key, fold_for_search, normalize_country_names, normalize_text, CountryTable,
};
pub use store::{CountryScope, MemoryStore, MessageStore, PgMessageStore, RecordFilter, StoreError};
