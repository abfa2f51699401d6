use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// why a single decode primitive rejected its input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid character {0:?} for the expected alphabet")]
    InvalidAlphabet(char),

    #[error("invalid block padding")]
    PaddingInvalid,

    #[error("key mismatch: {0}")]
    KeyMismatch(String),

    #[error("input is not valid utf-8")]
    InvalidUtf8,

    #[error("{0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// non-2xx or transport failure, worth one more try
    #[error("upstream unavailable at {url}: {reason}")]
    UpstreamUnavailable {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("challenge page detected at {url} (marker {marker:?})")]
    ChallengeDetected { url: String, marker: String },

    /// the extractor matched nothing, the provider most likely changed markup
    #[error("token not found at hop {hop_index} ({url})")]
    TokenNotFound { hop_index: usize, url: String },

    #[error("decode step {step} failed: {reason}")]
    DecodeStepFailed {
        step: &'static str,
        reason: DecodeError,
    },

    #[error("pipeline for {provider_key} failed at step {step_index}: {cause}")]
    DecodePipelineFailed {
        provider_key: String,
        step_index: usize,
        cause: Box<ResolutionError>,
    },

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("provider attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("attempt cancelled by the resolve deadline")]
    Cancelled,
}

impl ResolutionError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }

    pub fn decode(step: &'static str, reason: DecodeError) -> Self {
        Self::DecodeStepFailed { step, reason }
    }

    /// only transport-level failures get another try with the same request shape
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. } | Self::Timeout(_))
    }

    pub fn is_validation_failure(&self) -> bool {
        match self {
            Self::ValidationFailed { .. } => true,
            Self::DecodePipelineFailed { cause, .. } => cause.is_validation_failure(),
            _ => false,
        }
    }

    /// short stable label used for metrics and health output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::ChallengeDetected { .. } => "challenge_detected",
            Self::TokenNotFound { .. } => "token_not_found",
            Self::DecodeStepFailed { .. } => "decode_step_failed",
            Self::DecodePipelineFailed { .. } => "decode_pipeline_failed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// one provider's final outcome inside an aggregate failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderAttempt {
    pub provider_key: String,
    pub tries: u32,
    #[serde(serialize_with = "error_as_string")]
    pub error: ResolutionError,
}

fn error_as_string<S: serde::Serializer>(
    error: &ResolutionError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&error.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("no provider could resolve the request ({} attempted)", .attempts.len())]
pub struct AggregateResolutionError {
    /// in priority order, one entry per provider attempted
    pub attempts: Vec<ProviderAttempt>,
    pub deadline_exceeded: bool,
}

impl AggregateResolutionError {
    pub fn provider_keys(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .map(|a| a.provider_key.as_str())
            .collect()
    }
}
