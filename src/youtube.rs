#![forbid(unsafe_code)]

//! Blocking YouTube Data API v3 client.
//!
//! The backend uses it to proxy search and video-details reads (the browser
//! player never sees the key), the routine update job uses it to poll each
//! talent's recent uploads. All calls authenticate with the API key resolved
//! during bootstrap.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::secrets::SharedSlot;
use crate::store::CachedVideo;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
// Page size when polling a channel; routine updates only need the tail of
// recent uploads because earlier ones are already cached.
const POLL_RESULTS: u32 = 10;

/// Minimal metadata extracted from a search response item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVideo {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub published_at: Option<String>,
    pub live: bool,
}

impl RemoteVideo {
    pub fn into_cached(self) -> CachedVideo {
        CachedVideo {
            video_id: self.video_id,
            channel_id: self.channel_id,
            title: self.title,
            published_at: self.published_at,
            live: self.live,
            approved_at: None,
        }
    }
}

pub struct YoutubeClient {
    base_url: String,
    agent: ureq::Agent,
    api_key: SharedSlot<String>,
}

impl YoutubeClient {
    pub fn new(api_key: SharedSlot<String>) -> Self {
        Self::with_base_url(DEFAULT_API_BASE, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: SharedSlot<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            api_key,
        }
    }

    fn key(&self) -> Result<std::sync::Arc<String>> {
        self.api_key
            .get()
            .ok_or_else(|| anyhow!("no API key resolved; bootstrap must complete first"))
    }

    /// Proxies a search query, returning the upstream JSON verbatim.
    pub fn search(&self, query: &str, max_results: u32) -> Result<Value> {
        let key = self.key()?;
        let response = self
            .agent
            .get(&format!("{}/search", self.base_url))
            .query("part", "snippet")
            .query("type", "video")
            .query("q", query)
            .query("maxResults", &max_results.to_string())
            .query("key", &key)
            .call()
            .context("querying YouTube search")?;
        response.into_json().context("parsing search response")
    }

    /// Proxies a video-details read, returning the upstream JSON verbatim.
    pub fn video_details(&self, video_id: &str) -> Result<Value> {
        let key = self.key()?;
        let response = self
            .agent
            .get(&format!("{}/videos", self.base_url))
            .query("part", "snippet,contentDetails,statistics")
            .query("id", video_id)
            .query("key", &key)
            .call()
            .context("querying YouTube video details")?;
        response.into_json().context("parsing video details response")
    }

    /// Latest uploads (and live broadcasts) for one channel, newest first.
    pub fn recent_videos(&self, channel_id: &str) -> Result<Vec<RemoteVideo>> {
        let key = self.key()?;
        let response = self
            .agent
            .get(&format!("{}/search", self.base_url))
            .query("part", "snippet")
            .query("type", "video")
            .query("channelId", channel_id)
            .query("order", "date")
            .query("maxResults", &POLL_RESULTS.to_string())
            .query("key", &key)
            .call()
            .with_context(|| format!("polling channel {channel_id}"))?;
        let body: Value = response
            .into_json()
            .context("parsing channel poll response")?;
        parse_search_items(&body)
    }
}

/// Extracts the fields the relay cares about from a `search.list` response.
/// Items without a video id (channel/playlist results) are skipped.
fn parse_search_items(body: &Value) -> Result<Vec<RemoteVideo>> {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        bail!("search response missing items array");
    };

    let mut videos = Vec::new();
    for item in items {
        let Some(video_id) = item.pointer("/id/videoId").and_then(Value::as_str) else {
            continue;
        };
        let snippet = item.get("snippet");
        let field = |name: &str| {
            snippet
                .and_then(|snippet| snippet.get(name))
                .and_then(Value::as_str)
        };

        videos.push(RemoteVideo {
            video_id: video_id.to_owned(),
            channel_id: field("channelId").unwrap_or_default().to_owned(),
            title: field("title").unwrap_or_default().to_owned(),
            published_at: field("publishedAt").map(str::to_owned),
            live: field("liveBroadcastContent") == Some("live"),
        });
    }
    Ok(videos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_search_items_extracts_video_fields() {
        let body = json!({
            "items": [
                {
                    "id": {"kind": "youtube#video", "videoId": "abc123"},
                    "snippet": {
                        "channelId": "UCtalent",
                        "title": "First stream",
                        "publishedAt": "2024-05-01T12:00:00Z",
                        "liveBroadcastContent": "live"
                    }
                },
                {
                    "id": {"kind": "youtube#channel", "channelId": "UCother"},
                    "snippet": {"title": "Not a video"}
                },
                {
                    "id": {"videoId": "def456"},
                    "snippet": {
                        "channelId": "UCtalent",
                        "title": "Older upload",
                        "publishedAt": "2024-04-01T12:00:00Z",
                        "liveBroadcastContent": "none"
                    }
                }
            ]
        });

        let videos = parse_search_items(&body).unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].video_id, "abc123");
        assert!(videos[0].live);
        assert_eq!(videos[1].video_id, "def456");
        assert!(!videos[1].live);
        assert_eq!(videos[1].channel_id, "UCtalent");
    }

    #[test]
    fn parse_search_items_requires_items_array() {
        let err = parse_search_items(&json!({"error": {"code": 403}})).unwrap_err();
        assert!(err.to_string().contains("items"));
    }

    #[test]
    fn parse_search_items_handles_empty_response() {
        let videos = parse_search_items(&json!({"items": []})).unwrap();
        assert!(videos.is_empty());
    }

    #[test]
    fn requests_fail_fast_without_resolved_key() {
        let client = YoutubeClient::with_base_url("http://127.0.0.1:9", SharedSlot::empty());
        let err = client.search("query", 5).unwrap_err();
        assert!(err.to_string().contains("no API key"));

        let err = client.recent_videos("UCtalent").unwrap_err();
        assert!(err.to_string().contains("no API key"));
    }

    #[test]
    fn remote_video_converts_to_cache_row() {
        let remote = RemoteVideo {
            video_id: "abc".into(),
            channel_id: "UC1".into(),
            title: "Title".into(),
            published_at: Some("2024-01-01T00:00:00Z".into()),
            live: true,
        };
        let cached = remote.into_cached();
        assert_eq!(cached.video_id, "abc");
        assert!(cached.live);
        assert!(cached.approved_at.is_none());
    }
}
