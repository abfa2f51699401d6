use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::resolution::{MediaType, ResolutionRequest, ResolutionResult, Subtitle};

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_episode_fields"))]
pub struct ResolveQuery {
    #[validate(custom(function = "validate_content_id"))]
    pub content_id: String,
    #[serde(default = "default_media_type")]
    pub media_type: MediaType,
    #[validate(range(min = 1, max = 1000))]
    pub season: Option<u32>,
    #[validate(range(min = 1, max = 10000))]
    pub episode: Option<u32>,
}

fn default_media_type() -> MediaType {
    MediaType::Movie
}

// ids are trimmed before use, so the length rule applies to the trimmed value
fn validate_content_id(content_id: &str) -> Result<(), ValidationError> {
    match content_id.trim().chars().count() {
        0 => Err(ValidationError::new("content_id_is_blank")),
        1..=64 => Ok(()),
        _ => Err(ValidationError::new("content_id_too_long")),
    }
}

fn validate_episode_fields(query: &ResolveQuery) -> Result<(), ValidationError> {
    match (query.media_type, query.season, query.episode) {
        (MediaType::Episode, Some(_), Some(_)) => Ok(()),
        (MediaType::Episode, _, _) => Err(ValidationError::new("episode_requires_season_and_episode")),
        (MediaType::Movie, None, None) => Ok(()),
        (MediaType::Movie, _, _) => Err(ValidationError::new("movie_takes_no_season_or_episode")),
    }
}

impl From<ResolveQuery> for ResolutionRequest {
    fn from(query: ResolveQuery) -> Self {
        Self {
            content_id: query.content_id.trim().to_string(),
            media_type: query.media_type,
            season: query.season,
            episode: query.episode,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub provider: String,
    pub manifest_url: String,
    /// what the player should actually load, the manifest itself when there's no proxy
    pub playable_url: String,
    pub required_headers: BTreeMap<String, String>,
    pub subtitles: Vec<Subtitle>,
    pub expires_at: DateTime<Utc>,
}

impl ResolveResponse {
    pub fn new(result: ResolutionResult, playable_url: String) -> Self {
        Self {
            provider: result.provider_key,
            manifest_url: result.manifest_url,
            playable_url,
            required_headers: result.required_headers,
            subtitles: result.subtitles,
            expires_at: result.expires_at,
        }
    }
}
