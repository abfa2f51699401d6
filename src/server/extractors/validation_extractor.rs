use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use tracing::debug;
use validator::Validate;

use crate::server::error::Error;

/// query string that has been deserialized and run through its `Validate` rules
pub struct ValidatedQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::BadRequest(e.body_text()))?;

        value.validate().map_err(|e| {
            debug!("rejected query: {}", e);
            Error::BadRequest(e.to_string())
        })?;

        Ok(ValidatedQuery(value))
    }
}
