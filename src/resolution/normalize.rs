use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::resolution::{
    descriptor::ProviderDescriptor,
    models::{ResolutionResult, Subtitle},
    pipeline::DecodedPayload,
    walker::WalkOutcome,
};

const EXPIRY_PARAMS: &[&str] = &["expires", "expiry", "exp", "e", "valid_until"];
const MAX_EMBEDDED_EXPIRY_SECS: i64 = 7 * 24 * 3600;

fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Best-effort expiry: a unix timestamp in one of the usual query params, otherwise now + fallback.
pub fn expiry_from_url(manifest_url: &str, now: DateTime<Utc>, fallback: Duration) -> DateTime<Utc> {
    let fallback_at = now + chrono::Duration::from_std(fallback).unwrap_or(chrono::Duration::minutes(10));

    let Ok(parsed) = url::Url::parse(manifest_url) else {
        return fallback_at;
    };

    parsed
        .query_pairs()
        .filter(|(name, _)| EXPIRY_PARAMS.contains(&name.as_ref()))
        .filter_map(|(_, value)| value.parse::<i64>().ok())
        .filter(|ts| *ts > now.timestamp() && *ts - now.timestamp() <= MAX_EMBEDDED_EXPIRY_SECS)
        .find_map(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or(fallback_at)
}

fn subtitles_from_json(json: &Value) -> Vec<Subtitle> {
    ["/tracks", "/subtitles", "/captions"]
        .iter()
        .filter_map(|pointer| json.pointer(pointer).and_then(Value::as_array))
        .flatten()
        .filter_map(|track| {
            // thumbnails tracks show up in the same list
            if track.get("kind").and_then(Value::as_str) == Some("thumbnails") {
                return None;
            }
            let url = ["file", "url", "src"]
                .iter()
                .find_map(|f| track.get(*f).and_then(Value::as_str))?;
            let language = ["label", "lang", "language"]
                .iter()
                .find_map(|f| track.get(*f).and_then(Value::as_str))
                .unwrap_or("unknown");
            Some(Subtitle {
                url: url.to_string(),
                language: language.to_string(),
            })
        })
        .collect()
}

/// Turns a validated payload into the result handed to callers. Headers come from the descriptor
/// (templated against the last hop) and any `headers` object in a json payload; Referer is always set.
pub fn build_result(
    descriptor: &ProviderDescriptor,
    decoded: &DecodedPayload,
    walk: &WalkOutcome,
    default_expiry: Duration,
) -> ResolutionResult {
    let last_hop_origin = origin_of(&walk.last_hop_url).unwrap_or_else(|| walk.last_hop_url.clone());

    let mut required_headers: BTreeMap<String, String> = descriptor
        .playback_headers
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                value
                    .replace("{last_hop_url}", &walk.last_hop_url)
                    .replace("{last_hop_origin}", &last_hop_origin),
            )
        })
        .collect();

    let json: Option<Value> = serde_json::from_str(decoded.text.trim()).ok();
    let mut subtitles = Vec::new();
    if let Some(json) = &json {
        if let Some(headers) = json.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    required_headers.insert(name.clone(), value.to_string());
                }
            }
        }
        subtitles = subtitles_from_json(json);
    }

    if !required_headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("referer"))
    {
        required_headers.insert("Referer".to_string(), format!("{}/", last_hop_origin));
    }

    ResolutionResult {
        manifest_url: decoded.manifest_url.clone(),
        required_headers,
        subtitles,
        expires_at: expiry_from_url(&decoded.manifest_url, Utc::now(), default_expiry),
        provider_key: descriptor.provider_key.clone(),
    }
}
