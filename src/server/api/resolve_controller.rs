use axum::{Extension, Json, Router, routing::get};
use tracing::debug;

use crate::resolution::ResolutionRequest;
use crate::server::{
    dtos::resolve_dto::{ResolveQuery, ResolveResponse},
    error::AppResult,
    extractors::{ClientIdentity, ValidatedQuery},
    services::ResolverServices,
};

pub struct ResolveController;

impl ResolveController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::resolve))
    }

    async fn resolve(
        Extension(services): Extension<ResolverServices>,
        ClientIdentity(client_id): ClientIdentity,
        ValidatedQuery(query): ValidatedQuery<ResolveQuery>,
    ) -> AppResult<Json<ResolveResponse>> {
        let request = ResolutionRequest::from(query);
        debug!(
            "resolving {} {} for {}",
            request.media_type.as_str(),
            request.content_id,
            client_id
        );

        let result = services.orchestrator.resolve(&request).await?;
        let playable_url = services.playback.rewrite(&result, &client_id);

        Ok(Json(ResolveResponse::new(result, playable_url)))
    }
}
