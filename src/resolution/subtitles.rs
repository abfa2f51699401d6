use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::resolution::{
    descriptor::HttpMethod,
    error::ResolutionError,
    http::{DynHttpClient, HttpRequest},
    models::{ResolutionRequest, Subtitle},
};

pub type DynSubtitleService = Arc<dyn SubtitleService + Send + Sync>;

#[automock]
#[async_trait]
pub trait SubtitleService {
    async fn fetch(&self, request: &ResolutionRequest) -> Result<Vec<Subtitle>, ResolutionError>;
}

#[derive(Debug, Deserialize)]
struct SubtitleEntry {
    #[serde(alias = "file", alias = "src")]
    url: String,
    #[serde(alias = "label", alias = "lang", default = "unknown_language")]
    language: String,
}

fn unknown_language() -> String {
    "unknown".to_string()
}

/// Talks to an external subtitle index, `GET {base}/subtitles?content_id=..&type=..` returning a json array.
pub struct HttpSubtitleService {
    http: DynHttpClient,
    base_url: String,
    timeout: Duration,
}

impl HttpSubtitleService {
    pub fn new(http: DynHttpClient, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url_for(&self, request: &ResolutionRequest) -> String {
        let mut url = format!(
            "{}/subtitles?content_id={}&type={}",
            self.base_url,
            urlencoding::encode(&request.content_id),
            request.media_type.as_str()
        );
        if let (Some(season), Some(episode)) = (request.season, request.episode) {
            url.push_str(&format!("&season={}&episode={}", season, episode));
        }
        url
    }
}

#[async_trait]
impl SubtitleService for HttpSubtitleService {
    async fn fetch(&self, request: &ResolutionRequest) -> Result<Vec<Subtitle>, ResolutionError> {
        let url = self.url_for(request);
        let response = self
            .http
            .execute(HttpRequest {
                method: HttpMethod::Get,
                url: url.clone(),
                headers: vec![("Accept".to_string(), "application/json".to_string())],
                body: None,
                timeout: self.timeout,
            })
            .await
            .map_err(|e| ResolutionError::UpstreamUnavailable {
                url: url.clone(),
                status: None,
                reason: e.to_string(),
            })?;

        // no subtitles for this title
        if response.status == 404 {
            return Ok(Vec::new());
        }
        if !response.is_success() {
            return Err(ResolutionError::UpstreamUnavailable {
                url,
                status: Some(response.status),
                reason: format!("status {}", response.status),
            });
        }

        let entries: Vec<SubtitleEntry> = serde_json::from_slice(&response.body).map_err(|e| {
            warn!("subtitle index returned something that isn't a list: {}", e);
            ResolutionError::validation(format!("subtitle response: {}", e))
        })?;

        debug!("{} subtitles for {}", entries.len(), request.content_id);

        Ok(entries
            .into_iter()
            .map(|entry| Subtitle {
                url: entry.url,
                language: entry.language,
            })
            .collect())
    }
}
