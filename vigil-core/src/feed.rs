//! Feed source contract and its HTTP adapter.
//!
//! The pipeline only needs "recent messages of one channel since a cutoff";
//! everything about how the upstream authenticates stays behind
//! [`FeedSource`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::FeedConfig;
use crate::models::RawItem;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Feed credentials missing (set FEED_API_TOKEN)")]
    MissingCredentials,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),
}

impl FeedError {
    /// Configuration errors abort the fetch; everything else only skips a channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::MissingCredentials)
    }
}

/// One entry of the configured channel list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel: String,
    pub label: Option<String>,
}

impl ChannelSpec {
    /// Lower-cased label, or `"unknown"`.
    pub fn orientation(&self) -> String {
        self.label
            .as_deref()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Parses `"chan:label,@chan2"`. A leading `@` is dropped and channel names
/// keep only `[A-Za-z0-9_]`; entries left empty are skipped.
pub fn parse_channel_specs(raw: &str) -> Vec<ChannelSpec> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (name, label) = match entry.split_once(':') {
                Some((n, l)) => (n, Some(l.trim())),
                None => (entry, None),
            };
            let channel: String = name
                .trim()
                .trim_start_matches('@')
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if channel.is_empty() {
                return None;
            }
            Some(ChannelSpec {
                channel,
                label: label.filter(|l| !l.is_empty()).map(str::to_string),
            })
        })
        .collect()
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Messages of `channel` newer than `since`, at most `cap` of them.
    async fn list_recent(
        &self,
        channel: &ChannelSpec,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<Vec<RawItem>, FeedError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    id: i64,
    #[serde(default)]
    text: Option<String>,
    date: DateTime<Utc>,
    #[serde(default)]
    title: Option<String>,
}

/// `GET {base_url}/channels/{channel}/messages?since=..&limit=..`
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFeedSource {
    pub fn new(
        base_url: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FeedError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Token comes from `FEED_API_TOKEN`; its absence surfaces on first fetch.
    pub fn from_config(config: &FeedConfig) -> Result<Self, FeedError> {
        Self::new(
            config.base_url.clone(),
            std::env::var("FEED_API_TOKEN").ok(),
            Duration::from_secs(config.request_timeout_seconds),
        )
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn list_recent(
        &self,
        channel: &ChannelSpec,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<Vec<RawItem>, FeedError> {
        let token = self.token.as_ref().ok_or(FeedError::MissingCredentials)?;
        if channel.channel.is_empty() {
            return Err(FeedError::InvalidChannel(channel.channel.clone()));
        }

        let url = format!("{}/channels/{}/messages", self.base_url, channel.channel);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("since", since.to_rfc3339()), ("limit", cap.to_string())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FeedError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let messages: Vec<FeedMessage> = response.json().await?;
        let orientation = channel.orientation();

        let items: Vec<RawItem> = messages
            .into_iter()
            .filter(|m| m.date >= since)
            .filter_map(|m| {
                let text = m.text.filter(|t| !t.trim().is_empty())?;
                Some(RawItem {
                    source: m
                        .title
                        .filter(|t| !t.trim().is_empty())
                        .unwrap_or_else(|| channel.channel.clone()),
                    channel: channel.channel.clone(),
                    origin_message_id: m.id,
                    orientation: orientation.clone(),
                    label: channel.label.clone(),
                    text,
                    timestamp: m.date,
                })
            })
            .take(cap as usize)
            .collect();

        tracing::debug!(channel = %channel.channel, count = items.len(), "Fetched channel");
        Ok(items)
    }

    fn name(&self) -> &str {
        "http-feed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(channel: &str, label: Option<&str>) -> ChannelSpec {
        ChannelSpec {
            channel: channel.to_string(),
            label: label.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_channel_specs() {
        let specs = parse_channel_specs(" alpha:Left , @beta,,@g-a.m m a:  ,:orphan");
        assert_eq!(
            specs,
            vec![
                spec("alpha", Some("Left")),
                spec("beta", None),
                spec("gamma", None),
            ]
        );
        assert_eq!(specs[0].orientation(), "left");
        assert_eq!(specs[1].orientation(), "unknown");
    }

    #[tokio::test]
    async fn test_list_recent_maps_messages() {
        let mock_server = MockServer::start().await;
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        Mock::given(method("GET"))
            .and(path("/channels/alpha/messages"))
            .and(header("authorization", "Bearer tok"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": 7, "text": "Protest in Paris", "date": "2024-05-01T10:00:00Z", "title": "Alpha News" },
                { "id": 8, "text": "   ", "date": "2024-05-01T11:00:00Z" },
                { "id": 9, "text": "old", "date": "2024-04-30T11:00:00Z" },
                { "id": 10, "text": "no title", "date": "2024-05-01T12:00:00Z" }
            ])))
            .mount(&mock_server)
            .await;

        let feed = HttpFeedSource::new(mock_server.uri(), Some("tok".into()), Duration::from_secs(5))
            .unwrap();
        let items = feed
            .list_recent(&spec("alpha", Some("Left")), since, 10)
            .await
            .expect("fetch should succeed");

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].origin_message_id, 7);
        assert_eq!(items[0].source, "Alpha News");
        assert_eq!(items[0].orientation, "left");
        assert_eq!(items[0].label.as_deref(), Some("Left"));
        assert_eq!(items[1].source, "alpha");
    }

    #[tokio::test]
    async fn test_list_recent_without_token_is_fatal() {
        let feed = HttpFeedSource::new("http://127.0.0.1:1".into(), None, Duration::from_secs(1))
            .unwrap();
        let err = feed
            .list_recent(&spec("alpha", None), Utc::now(), 10)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_list_recent_surfaces_api_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such channel"))
            .mount(&mock_server)
            .await;

        let feed = HttpFeedSource::new(mock_server.uri(), Some("tok".into()), Duration::from_secs(5))
            .unwrap();
        match feed.list_recent(&spec("nope", None), Utc::now(), 5).await {
            Err(FeedError::Api { code, .. }) => assert_eq!(code, 404),
            other => panic!("Expected Api error, got {:?}", other),
        }
    }
}
