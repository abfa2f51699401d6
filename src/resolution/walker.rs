use std::time::Duration;

use tracing::{debug, info, warn};

use crate::resolution::{
    descriptor::{HopStep, RefererSource, TemplateContext},
    error::ResolutionError,
    http::{DynHttpClient, HttpError, HttpRequest, HttpResponse},
    models::ResolutionRequest,
};

/// Markers of bot-mitigation pages, matched against the lowercased body. Provider agnostic on purpose,
/// a challenge looks the same whichever embed served it.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "challenge-platform",
    "cf_chl_opt",
    "<title>just a moment...</title>",
    "attention required! | cloudflare",
    "checking your browser before accessing",
    "ddos-guard",
    "g-recaptcha",
    "h-captcha",
    "hcaptcha.com/1/api.js",
    "turnstile/v0/api.js",
];

pub fn detect_challenge(response: &HttpResponse) -> Option<String> {
    if let Some(mitigated) = response.headers.get("cf-mitigated") {
        return Some(format!("cf-mitigated: {}", mitigated));
    }

    let body = String::from_utf8_lossy(&response.body).to_ascii_lowercase();
    CHALLENGE_MARKERS
        .iter()
        .find(|marker| body.contains(*marker))
        .map(|marker| marker.to_string())
}

/// what a successful walk hands to the decode pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkOutcome {
    pub payload: Vec<u8>,
    /// tokens in hop order, the last one is a lossy text view of the payload
    pub tokens: Vec<String>,
    pub last_hop_url: String,
}

/// Walks one hop chain. Stateless, no retries; how often to try a provider is the orchestrator's call.
#[derive(Clone)]
pub struct HopChainWalker {
    http: DynHttpClient,
    hop_timeout: Duration,
}

impl HopChainWalker {
    pub fn new(http: DynHttpClient, hop_timeout: Duration) -> Self {
        Self { http, hop_timeout }
    }

    pub async fn walk(
        &self,
        hop_chain: &[HopStep],
        request: &ResolutionRequest,
    ) -> Result<WalkOutcome, ResolutionError> {
        let mut token = request.content_id.clone();
        let mut previous_url: Option<String> = None;
        let mut tokens = Vec::with_capacity(hop_chain.len());

        for (hop_index, hop) in hop_chain.iter().enumerate() {
            let context = TemplateContext {
                request,
                token: &token,
            };

            // a url we can't build is the same failure as a token we can't find
            let url = hop
                .render_url(&context, previous_url.as_deref())
                .map_err(|reason| {
                    warn!("hop {} url can't be built: {}", hop_index, reason);
                    ResolutionError::TokenNotFound {
                        hop_index,
                        url: previous_url.clone().unwrap_or_default(),
                    }
                })?;

            let http_request = self.build_request(hop, &context, &url, previous_url.as_deref());
            debug!("hop {} -> {}", hop_index, url);

            let response = self.http.execute(http_request).await.map_err(|e| {
                warn!("hop {} to {} failed: {}", hop_index, url, e);
                ResolutionError::UpstreamUnavailable {
                    url: url.clone(),
                    status: None,
                    reason: match e {
                        HttpError::Timeout => "timed out".to_string(),
                        HttpError::Transport(reason) => reason,
                    },
                }
            })?;

            if let Some(marker) = detect_challenge(&response) {
                info!("hop {} to {} hit a challenge page ({})", hop_index, url, marker);
                return Err(ResolutionError::ChallengeDetected { url, marker });
            }

            if !response.is_success() {
                warn!("hop {} to {} returned status {}", hop_index, url, response.status);
                return Err(ResolutionError::UpstreamUnavailable {
                    url,
                    status: Some(response.status),
                    reason: format!("status {}", response.status),
                });
            }

            let next = hop
                .token_extractor
                .extract(&response.body, &response.final_url, &token)
                .ok_or_else(|| {
                    warn!("hop {} to {} had no token", hop_index, url);
                    ResolutionError::TokenNotFound {
                        hop_index,
                        url: url.clone(),
                    }
                })?;

            if hop.is_terminal {
                debug!("hop {} is terminal, payload is {} bytes", hop_index, next.len());
                tokens.push(String::from_utf8_lossy(&next).into_owned());
                return Ok(WalkOutcome {
                    payload: next,
                    tokens,
                    last_hop_url: response.final_url,
                });
            }

            // intermediate tokens end up in urls and headers
            let next = String::from_utf8_lossy(&next).trim().to_string();
            if next.is_empty() {
                warn!("hop {} to {} had a blank token", hop_index, url);
                return Err(ResolutionError::TokenNotFound { hop_index, url });
            }
            tokens.push(next.clone());

            token = next;
            previous_url = Some(response.final_url);
        }

        // descriptors are validated to end on a terminal hop, this only guards hand built chains
        Err(ResolutionError::TokenNotFound {
            hop_index: hop_chain.len(),
            url: previous_url.unwrap_or_default(),
        })
    }

    fn build_request(
        &self,
        hop: &HopStep,
        context: &TemplateContext<'_>,
        url: &str,
        previous_url: Option<&str>,
    ) -> HttpRequest {
        let mut headers: Vec<(String, String)> = Vec::new();

        let referer = match &hop.referer_source {
            RefererSource::PreviousHop => previous_url.map(str::to_string),
            RefererSource::Fixed(value) => Some(value.clone()),
            RefererSource::None => None,
        };
        if let Some(referer) = referer {
            headers.push(("Referer".to_string(), referer));
        }

        for (name, value) in &hop.headers {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), context.render(value)));
        }

        HttpRequest {
            method: hop.method,
            url: url.to_string(),
            headers,
            body: hop.body_template.as_deref().map(|b| context.render(b)),
            timeout: self.hop_timeout,
        }
    }
}
