use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use mockall::automock;
use tracing::debug;

use crate::resolution::ResolutionResult;
use crate::server::utils::signature_utils::SignatureUtil;

pub type DynPlaybackProxy = Arc<dyn PlaybackProxy + Send + Sync>;

/// Turns a resolved manifest into something a browser can play. Proxying itself happens elsewhere.
#[automock]
pub trait PlaybackProxy {
    fn rewrite(&self, result: &ResolutionResult, client_id: &str) -> String;
}

/// no proxy configured, the client talks to the upstream cdn itself
pub struct DirectPlayback;

impl PlaybackProxy for DirectPlayback {
    fn rewrite(&self, result: &ResolutionResult, _client_id: &str) -> String {
        result.manifest_url.clone()
    }
}

/// Points the client at the playback proxy, with the manifest and its required headers packed into a
/// signed url so the proxy can't be used as an open relay.
pub struct SignedProxyRewriter {
    base_url: String,
    signature_util: Arc<SignatureUtil>,
    // upper bound on how long a signed url lives, the manifest expiry usually comes first
    max_lifetime_minutes: i64,
}

impl SignedProxyRewriter {
    pub fn new(base_url: impl Into<String>, signature_util: Arc<SignatureUtil>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signature_util,
            max_lifetime_minutes: 6 * 60,
        }
    }

    pub fn encode_url(url: &str) -> String {
        URL_SAFE_NO_PAD.encode(url.as_bytes())
    }
}

impl PlaybackProxy for SignedProxyRewriter {
    fn rewrite(&self, result: &ResolutionResult, client_id: &str) -> String {
        let encoded_url = Self::encode_url(&result.manifest_url);

        // BTreeMap serializes in key order so the same headers always encode the same way
        let headers_json = serde_json::to_string(&result.required_headers).unwrap_or_default();
        let encoded_headers = URL_SAFE_NO_PAD.encode(headers_json.as_bytes());

        let expiry = result
            .expires_at
            .timestamp()
            .min(SignatureUtil::generate_expiry(self.max_lifetime_minutes))
            .max(Utc::now().timestamp());

        let signature = self
            .signature_util
            .generate_signature(client_id, expiry, &encoded_url);

        debug!("signed playback url for {} until {}", client_id, expiry);

        format!(
            "{}/api/v1/proxy?url={}&headers={}&sig={}&exp={}&client={}",
            self.base_url, encoded_url, encoded_headers, signature, expiry, client_id
        )
    }
}
