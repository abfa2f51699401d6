use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Episode => "episode",
        }
    }
}

/// what the caller wants played, read-only for the whole resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub content_id: String,
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl ResolutionRequest {
    pub fn movie(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            media_type: MediaType::Movie,
            season: None,
            episode: None,
        }
    }

    pub fn episode(content_id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            content_id: content_id.into(),
            media_type: MediaType::Episode,
            season: Some(season),
            episode: Some(episode),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtitle {
    pub url: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub manifest_url: String,
    /// always carries at least `Referer`
    pub required_headers: BTreeMap<String, String>,
    pub subtitles: Vec<Subtitle>,
    pub expires_at: DateTime<Utc>,
    pub provider_key: String,
}

/// diagnostic view of one provider, never shown to end users
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub provider_key: String,
    pub priority: i32,
    pub enabled: bool,
    pub disabled_for_secs: Option<u64>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub recent_validation_failures: usize,
}
