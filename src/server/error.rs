use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::resolution::AggregateResolutionError;

pub type AppResult<T> = Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    // detail stays in the logs and provider health, callers just learn it didn't work
    #[error(transparent)]
    ResolutionFailed(#[from] AggregateResolutionError),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ResolutionFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            Error::ResolutionFailed(aggregate) => {
                warn!(
                    "resolution failed across {:?} (deadline exceeded: {})",
                    aggregate.provider_keys(),
                    aggregate.deadline_exceeded
                );
                "no playable stream found for this title".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
