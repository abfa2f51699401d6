use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use regex::bytes::Regex as BytesRegex;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::resolution::{
    models::{MediaType, ResolutionRequest},
    pipeline::{DecodePipeline, DecodeStep, ResultValidator},
};

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("provider {provider}: {reason}")]
    Invalid { provider: String, reason: String },

    #[error("duplicate provider key {0}")]
    DuplicateKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// where the `Referer` of a hop comes from
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefererSource {
    #[default]
    PreviousHop,
    Fixed(String),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    #[default]
    Body,
    FinalUrl,
}

/// css selector that keeps its source around for logs
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct CssSelector {
    source: String,
    selector: Selector,
}

impl TryFrom<String> for CssSelector {
    type Error = String;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        let selector =
            Selector::parse(&source).map_err(|e| format!("invalid selector {:?}: {}", source, e))?;
        Ok(Self { source, selector })
    }
}

impl fmt::Debug for CssSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CssSelector({:?})", self.source)
    }
}

const TOKEN_PLACEHOLDER: &str = "{token}";

/// Byte regex for token extraction. `{token}` stands for the token carried from the previous hop and is
/// regex-escaped before matching, so patterns using it are compiled per hop.
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct TokenPattern {
    source: String,
    compiled: Option<BytesRegex>,
}

impl TryFrom<String> for TokenPattern {
    type Error = String;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        if source.contains(TOKEN_PLACEHOLDER) {
            BytesRegex::new(&source.replace(TOKEN_PLACEHOLDER, "token"))
                .map_err(|e| format!("invalid pattern {:?}: {}", source, e))?;
            return Ok(Self {
                source,
                compiled: None,
            });
        }

        let compiled =
            BytesRegex::new(&source).map_err(|e| format!("invalid pattern {:?}: {}", source, e))?;
        Ok(Self {
            source,
            compiled: Some(compiled),
        })
    }
}

impl TokenPattern {
    pub fn for_token(&self, token: &str) -> Option<Cow<'_, BytesRegex>> {
        match &self.compiled {
            Some(compiled) => Some(Cow::Borrowed(compiled)),
            None => BytesRegex::new(&self.source.replace(TOKEN_PLACEHOLDER, &regex::escape(token)))
                .ok()
                .map(Cow::Owned),
        }
    }
}

impl fmt::Debug for TokenPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenPattern({:?})", self.source)
    }
}

fn default_group() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenExtractor {
    Regex {
        pattern: TokenPattern,
        #[serde(default = "default_group")]
        group: usize,
        #[serde(default)]
        source: MatchSource,
    },
    /// text of the first match, or one of its attributes
    Css {
        selector: CssSelector,
        attribute: Option<String>,
    },
    JsonPointer { pointer: String },
    WholeBody,
}

impl TokenExtractor {
    /// Pulls the next token out of a hop response. Regex captures and whole bodies come back byte for
    /// byte, since a terminal payload may be binary. Css and json pointer tokens are text and get trimmed.
    pub fn extract(&self, body: &[u8], final_url: &str, carried_token: &str) -> Option<Vec<u8>> {
        let token = match self {
            TokenExtractor::Regex {
                pattern,
                group,
                source,
            } => {
                let haystack = match source {
                    MatchSource::Body => body,
                    MatchSource::FinalUrl => final_url.as_bytes(),
                };
                pattern
                    .for_token(carried_token)?
                    .captures(haystack)?
                    .get(*group)?
                    .as_bytes()
                    .to_vec()
            }
            TokenExtractor::Css {
                selector,
                attribute,
            } => {
                // Html isn't Send, keep it inside this sync call
                let document = Html::parse_document(&String::from_utf8_lossy(body));
                let element = document.select(&selector.selector).next()?;
                let text = match attribute {
                    Some(name) => element.value().attr(name)?.to_string(),
                    None => element.text().collect::<String>(),
                };
                text.trim().as_bytes().to_vec()
            }
            TokenExtractor::JsonPointer { pointer } => {
                let json: Value = serde_json::from_slice(body).ok()?;
                let text = match json.pointer(pointer)? {
                    Value::String(s) => s.clone(),
                    Value::Null => return None,
                    other => other.to_string(),
                };
                text.trim().as_bytes().to_vec()
            }
            TokenExtractor::WholeBody => body.to_vec(),
        };

        (!token.is_empty()).then_some(token)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HopStep {
    /// placeholders: {content_id} {media_type} {season} {episode} {token} {token_encoded}
    pub url_template: String,
    /// used instead of url_template when resolving an episode
    pub episode_url_template: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    pub body_template: Option<String>,
    #[serde(default)]
    pub referer_source: RefererSource,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub token_extractor: TokenExtractor,
    #[serde(default)]
    pub is_terminal: bool,
}

/// values available to hop templates
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub request: &'a ResolutionRequest,
    pub token: &'a str,
}

impl TemplateContext<'_> {
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{content_id}", &self.request.content_id)
            .replace("{media_type}", self.request.media_type.as_str())
            .replace(
                "{season}",
                &self.request.season.map(|s| s.to_string()).unwrap_or_default(),
            )
            .replace(
                "{episode}",
                &self.request.episode.map(|e| e.to_string()).unwrap_or_default(),
            )
            .replace("{token_encoded}", &urlencoding::encode(self.token))
            .replace("{token}", self.token)
    }
}

impl HopStep {
    pub fn template_for(&self, media_type: MediaType) -> &str {
        match (media_type, &self.episode_url_template) {
            (MediaType::Episode, Some(template)) => template,
            _ => &self.url_template,
        }
    }

    /// Renders the hop url. Anything that doesn't parse as an absolute url (`/path`, `//host/path`)
    /// is joined onto the previous hop.
    pub fn render_url(
        &self,
        context: &TemplateContext<'_>,
        previous_url: Option<&str>,
    ) -> Result<String, String> {
        let rendered = context.render(self.template_for(context.request.media_type));

        match url::Url::parse(&rendered) {
            Ok(url) => Ok(url.to_string()),
            Err(_) => {
                let base = previous_url
                    .ok_or_else(|| format!("{:?} is relative and there is no previous hop", rendered))?;
                url::Url::parse(base)
                    .and_then(|b| b.join(&rendered))
                    .map(|u| u.to_string())
                    .map_err(|e| format!("can't resolve {:?} against {}: {}", rendered, base, e))
            }
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_validator() -> ResultValidator {
    ResultValidator::ManifestUrl
}

/// Static description of one upstream: how to walk to its payload and how to decode it. Loaded once at
/// startup and never mutated, the registry only flips its enabled state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub provider_key: String,
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub hop_chain: Vec<HopStep>,
    #[serde(default)]
    pub decode_pipeline: Vec<DecodeStep>,
    #[serde(default = "default_validator")]
    pub result_validator: ResultValidator,
    /// may use {last_hop_url} and {last_hop_origin}
    #[serde(default)]
    pub playback_headers: BTreeMap<String, String>,
}

impl ProviderDescriptor {
    pub fn pipeline(&self) -> DecodePipeline<'_> {
        DecodePipeline {
            provider_key: &self.provider_key,
            steps: &self.decode_pipeline,
            validator: &self.result_validator,
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        let invalid = |reason: String| DescriptorError::Invalid {
            provider: self.provider_key.clone(),
            reason,
        };

        if self.provider_key.trim().is_empty() {
            return Err(invalid("provider key is empty".to_string()));
        }
        if self.hop_chain.is_empty() {
            return Err(invalid("hop chain is empty".to_string()));
        }

        let last = self.hop_chain.len() - 1;
        for (index, hop) in self.hop_chain.iter().enumerate() {
            if hop.is_terminal != (index == last) {
                return Err(invalid(format!(
                    "hop {} is_terminal={} but only the last hop may be terminal",
                    index, hop.is_terminal
                )));
            }
            if hop.url_template.trim().is_empty() {
                return Err(invalid(format!("hop {} has an empty url template", index)));
            }
        }

        for (index, step) in self.decode_pipeline.iter().enumerate() {
            step.check()
                .map_err(|reason| invalid(format!("decode step {}: {}", index, reason)))?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    providers: Vec<ProviderDescriptor>,
}

pub fn parse_descriptors(json: &str) -> anyhow::Result<Vec<ProviderDescriptor>> {
    let file: ProvidersFile =
        serde_json::from_str(json).context("failed to parse provider descriptors")?;

    for descriptor in &file.providers {
        descriptor.validate()?;
    }

    Ok(file.providers)
}

pub fn load_descriptors(path: &Path) -> anyhow::Result<Vec<ProviderDescriptor>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read provider descriptors from {}", path.display()))?;
    parse_descriptors(&json)
}
