use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::resolution::{
    error::{DecodeError, ResolutionError},
    primitives::{self, AlphabetClass, SubstitutionMap},
};

/// keystreams recovered from a known plaintext prefix, keyed by step index
pub type KeyRing = HashMap<usize, Vec<u8>>;

/// Key material in config: `hex:...`, `b64:...`, anything else is taken as raw text.
pub fn key_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_key(&raw).map_err(serde::de::Error::custom)
}

fn optional_key_bytes<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|r| parse_key(&r).map_err(serde::de::Error::custom))
        .transpose()
}

pub fn parse_key(raw: &str) -> Result<Vec<u8>, String> {
    if let Some(hex_key) = raw.strip_prefix("hex:") {
        hex::decode(hex_key).map_err(|e| format!("invalid hex key: {}", e))
    } else if let Some(b64_key) = raw.strip_prefix("b64:") {
        base64::engine::general_purpose::STANDARD
            .decode(b64_key)
            .map_err(|e| format!("invalid base64 key: {}", e))
    } else {
        Ok(raw.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeySource {
    Fixed(#[serde(deserialize_with = "key_bytes")] Vec<u8>),
    /// plaintext every response starts with, the keystream is recovered from it once and reused
    DerivedFromKnownPrefix(String),
}

fn default_true() -> bool {
    true
}

fn default_depth() -> usize {
    4
}

fn default_classes() -> Vec<AlphabetClass> {
    vec![AlphabetClass::Lower, AlphabetClass::Upper, AlphabetClass::Digit]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DecodeStep {
    Base64Decode {
        #[serde(default)]
        url_safe: bool,
    },
    NestedBase64 {
        #[serde(default = "default_depth")]
        max_depth: usize,
    },
    XorKeystream {
        key: KeySource,
        #[serde(default = "default_true")]
        cycle: bool,
    },
    AesCbcDecrypt {
        #[serde(deserialize_with = "key_bytes")]
        key: Vec<u8>,
        #[serde(deserialize_with = "key_bytes")]
        iv: Vec<u8>,
    },
    #[serde(rename = "chacha20_decrypt")]
    ChaCha20Decrypt {
        #[serde(deserialize_with = "key_bytes")]
        key: Vec<u8>,
        #[serde(default)]
        counter: u32,
    },
    CharSubstitution {
        map: SubstitutionMap,
    },
    CaesarShift {
        amount: i32,
        #[serde(default = "default_classes")]
        alphabet_classes: Vec<AlphabetClass>,
    },
    PrintableRotate {
        amount: i32,
    },
    SplitJoinLookup {
        delimiter: char,
        #[serde(default)]
        alphabet: String,
        #[serde(default)]
        char_offset: i64,
        #[serde(default, deserialize_with = "optional_key_bytes")]
        xor_key: Option<Vec<u8>>,
    },
    JsonBoundaryScan {},
    HexDecode,
    Reverse,
    ByteShift {
        amount: i16,
    },
    StripMarkers {
        markers: Vec<String>,
    },
    Slice {
        #[serde(default)]
        skip_prefix: usize,
        #[serde(default)]
        skip_suffix: usize,
    },
    TakeEvery {
        step: usize,
        #[serde(default)]
        offset: usize,
    },
    GzipInflate,
}

impl DecodeStep {
    pub fn name(&self) -> &'static str {
        match self {
            DecodeStep::Base64Decode { .. } => "base64_decode",
            DecodeStep::NestedBase64 { .. } => "nested_base64",
            DecodeStep::XorKeystream { .. } => "xor_keystream",
            DecodeStep::AesCbcDecrypt { .. } => "aes_cbc_decrypt",
            DecodeStep::ChaCha20Decrypt { .. } => "chacha20_decrypt",
            DecodeStep::CharSubstitution { .. } => "char_substitution",
            DecodeStep::CaesarShift { .. } => "caesar_shift",
            DecodeStep::PrintableRotate { .. } => "printable_rotate",
            DecodeStep::SplitJoinLookup { .. } => "split_join_lookup",
            DecodeStep::JsonBoundaryScan {} => "json_boundary_scan",
            DecodeStep::HexDecode => "hex_decode",
            DecodeStep::Reverse => "reverse",
            DecodeStep::ByteShift { .. } => "byte_shift",
            DecodeStep::StripMarkers { .. } => "strip_markers",
            DecodeStep::Slice { .. } => "slice",
            DecodeStep::TakeEvery { .. } => "take_every",
            DecodeStep::GzipInflate => "gzip_inflate",
        }
    }

    /// configuration problems that would otherwise only show up on the first request
    pub fn check(&self) -> Result<(), String> {
        match self {
            DecodeStep::AesCbcDecrypt { key, iv } => {
                if ![16, 24, 32].contains(&key.len()) {
                    return Err(format!("aes key must be 16, 24 or 32 bytes, got {}", key.len()));
                }
                if iv.len() != 16 {
                    return Err(format!("aes iv must be 16 bytes, got {}", iv.len()));
                }
            }
            DecodeStep::ChaCha20Decrypt { key, .. } if key.len() != 32 => {
                return Err(format!("chacha20 key must be 32 bytes, got {}", key.len()));
            }
            DecodeStep::XorKeystream {
                key: KeySource::Fixed(key),
                ..
            } if key.is_empty() => return Err("xor key is empty".to_string()),
            DecodeStep::XorKeystream {
                key: KeySource::DerivedFromKnownPrefix(prefix),
                ..
            } if prefix.is_empty() => return Err("known prefix is empty".to_string()),
            DecodeStep::TakeEvery { step: 0, .. } => {
                return Err("take_every step must be positive".to_string());
            }
            DecodeStep::SplitJoinLookup { alphabet, .. }
                if !alphabet.is_empty() && alphabet.chars().count() < 2 =>
            {
                return Err("lookup alphabet needs at least two digits".to_string());
            }
            _ => {}
        }
        Ok(())
    }

    /// One step of the fold. Returns the new payload and, for a derived keystream, the key it
    /// recovered so the caller can keep it.
    fn apply(
        &self,
        input: &[u8],
        cached_key: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Option<Vec<u8>>), ResolutionError> {
        let step = self.name();
        let wrap = |reason: DecodeError| ResolutionError::decode(step, reason);

        let output = match self {
            DecodeStep::Base64Decode { url_safe } => {
                primitives::base64_decode(input, *url_safe).map_err(wrap)?
            }
            DecodeStep::NestedBase64 { max_depth } => {
                primitives::nested_base64(input, *max_depth).map_err(wrap)?
            }
            DecodeStep::XorKeystream { key, cycle } => {
                let (key, derived) = match (key, cached_key) {
                    (KeySource::Fixed(fixed), _) => (fixed.clone(), None),
                    (KeySource::DerivedFromKnownPrefix(_), Some(cached)) => {
                        (cached.to_vec(), None)
                    }
                    (KeySource::DerivedFromKnownPrefix(prefix), None) => {
                        let derived =
                            primitives::derive_keystream(input, prefix.as_bytes()).map_err(wrap)?;
                        debug!("derived a {} byte keystream from the known prefix", derived.len());
                        (derived.clone(), Some(derived))
                    }
                };
                let output = primitives::xor_keystream(input, &key, *cycle).map_err(wrap)?;
                return Ok((output, derived));
            }
            DecodeStep::AesCbcDecrypt { key, iv } => {
                primitives::aes_cbc_decrypt(input, key, iv).map_err(wrap)?
            }
            DecodeStep::ChaCha20Decrypt { key, counter } => {
                primitives::chacha20_decrypt(input, key, *counter).map_err(wrap)?
            }
            DecodeStep::CharSubstitution { map } => {
                primitives::char_substitution(input, map).map_err(wrap)?
            }
            DecodeStep::CaesarShift {
                amount,
                alphabet_classes,
            } => primitives::caesar_shift(input, *amount, alphabet_classes).map_err(wrap)?,
            DecodeStep::PrintableRotate { amount } => {
                primitives::printable_rotate(input, *amount).map_err(wrap)?
            }
            DecodeStep::SplitJoinLookup {
                delimiter,
                alphabet,
                char_offset,
                xor_key,
            } => primitives::split_join_lookup(
                input,
                *delimiter,
                alphabet,
                *char_offset,
                xor_key.as_deref(),
            )
            .map_err(wrap)?,
            DecodeStep::JsonBoundaryScan {} => primitives::json_boundary_scan(input)?,
            DecodeStep::HexDecode => primitives::hex_decode(input).map_err(wrap)?,
            DecodeStep::Reverse => primitives::reverse(input).map_err(wrap)?,
            DecodeStep::ByteShift { amount } => {
                primitives::byte_shift(input, *amount).map_err(wrap)?
            }
            DecodeStep::StripMarkers { markers } => {
                primitives::strip_markers(input, markers).map_err(wrap)?
            }
            DecodeStep::Slice {
                skip_prefix,
                skip_suffix,
            } => primitives::slice(input, *skip_prefix, *skip_suffix).map_err(wrap)?,
            DecodeStep::TakeEvery { step, offset } => {
                primitives::take_every(input, *step, *offset).map_err(wrap)?
            }
            DecodeStep::GzipInflate => primitives::gzip_inflate(input).map_err(wrap)?,
        };

        Ok((output, None))
    }
}

/// a compiled regex that can come straight out of the provider config
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct Pattern(pub Regex);

impl TryFrom<String> for Pattern {
    type Error = regex::Error;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Regex::new(&source).map(Pattern)
    }
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Pattern)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.0.as_str())
    }
}

fn default_sources_pointer() -> String {
    "/sources".to_string()
}

/// shape check over the fully decoded payload, also knows where the manifest lives in it
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultValidator {
    /// the payload is itself the manifest url
    ManifestUrl,
    /// json with a non-empty sources array
    JsonSources {
        #[serde(default = "default_sources_pointer")]
        pointer: String,
    },
    /// capture group 1 (or the whole match) is the manifest url
    Regex { pattern: Pattern },
}

pub fn is_http_url(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    (trimmed.starts_with("https://") || trimmed.starts_with("http://"))
        && !trimmed.chars().any(char::is_whitespace)
        && url::Url::parse(trimmed)
            .map(|u| u.host_str().is_some())
            .unwrap_or(false)
}

impl ResultValidator {
    pub fn label(&self) -> &'static str {
        match self {
            ResultValidator::ManifestUrl => "manifest url",
            ResultValidator::JsonSources { .. } => "json sources",
            ResultValidator::Regex { .. } => "regex",
        }
    }

    pub fn validate(&self, payload: &str) -> bool {
        self.manifest_url(payload).is_some()
    }

    pub fn manifest_url(&self, payload: &str) -> Option<String> {
        match self {
            ResultValidator::ManifestUrl => {
                let trimmed = payload.trim();
                is_http_url(trimmed).then(|| trimmed.to_string())
            }
            ResultValidator::JsonSources { pointer } => {
                let json: Value = serde_json::from_str(payload.trim()).ok()?;
                let first = json.pointer(pointer)?.as_array()?.first()?;
                let url = match first {
                    Value::String(url) => url.as_str(),
                    Value::Object(source) => ["file", "url", "src"]
                        .iter()
                        .find_map(|field| source.get(*field).and_then(Value::as_str))?,
                    _ => return None,
                };
                is_http_url(url).then(|| url.trim().to_string())
            }
            ResultValidator::Regex { pattern } => {
                let captures = pattern.0.captures(payload)?;
                let url = captures.get(1).or_else(|| captures.get(0))?.as_str();
                is_http_url(url).then(|| url.trim().to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub text: String,
    pub manifest_url: String,
    /// keystreams recovered during this run, only worth keeping because validation passed
    pub derived_keys: Vec<(usize, Vec<u8>)>,
}

/// one provider's decode steps together with its validator
pub struct DecodePipeline<'a> {
    pub provider_key: &'a str,
    pub steps: &'a [DecodeStep],
    pub validator: &'a ResultValidator,
}

impl DecodePipeline<'_> {
    /// Folds the raw payload through every step, stopping at the first failure. A run that completes
    /// but fails the validator is reported the same way a broken step would be.
    pub fn run(&self, input: &[u8], keys: &KeyRing) -> Result<DecodedPayload, ResolutionError> {
        let mut current = input.to_vec();
        let mut derived_keys = Vec::new();

        for (step_index, step) in self.steps.iter().enumerate() {
            let cached = keys.get(&step_index).map(Vec::as_slice);
            let (output, derived) = step.apply(&current, cached).map_err(|cause| {
                ResolutionError::DecodePipelineFailed {
                    provider_key: self.provider_key.to_string(),
                    step_index,
                    cause: Box::new(cause),
                }
            })?;

            if let Some(key) = derived {
                derived_keys.push((step_index, key));
            }
            current = output;
        }

        let text = String::from_utf8(current)
            .map_err(|_| ResolutionError::validation("decoded payload is not valid utf-8"))?;

        let manifest_url = self.validator.manifest_url(&text).ok_or_else(|| {
            ResolutionError::validation(format!(
                "decoded payload doesn't match the {} shape",
                self.validator.label()
            ))
        })?;

        Ok(DecodedPayload {
            text,
            manifest_url,
            derived_keys,
        })
    }
}
