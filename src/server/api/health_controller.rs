use axum::{Extension, Json, Router, http::StatusCode, routing::get};
use chrono::Utc;
use tracing::warn;

use crate::server::dtos::health_dto::{HealthResponse, HealthStatus};
use crate::server::services::ResolverServices;
use crate::server::{get_app_version, get_uptime_seconds};

pub struct HealthController;

impl HealthController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::providers_health))
    }

    /// per-provider breaker state and last errors, meant for operators
    async fn providers_health(
        Extension(services): Extension<ResolverServices>,
    ) -> (StatusCode, Json<HealthResponse>) {
        let providers = services.orchestrator.list_provider_health();
        let status = HealthStatus::from_providers(&providers);

        if status != HealthStatus::Healthy {
            warn!(
                "{} of {} providers disabled",
                providers.iter().filter(|p| !p.enabled).count(),
                providers.len()
            );
        }

        let response = HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: get_uptime_seconds(),
            version: get_app_version().to_string(),
            environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
            cached_results: services.orchestrator.cache().len(),
            providers,
        };

        let http_status = match status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };

        (http_status, Json(response))
    }
}
