pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Context;
use axum::{
    Extension, Router,
    extract::Request,
    http::{HeaderValue, Method},
    routing::get,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower::{Layer, limit::ConcurrencyLimitLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    normalize_path::NormalizePathLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::AppConfig;
use api::{health_controller::HealthController, resolve_controller::ResolveController};
use error::Error;
use services::ResolverServices;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn get_uptime_seconds() -> u64 {
    START_TIME.get_or_init(Instant::now).elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct ResolverApplicationServer;

impl ResolverApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        START_TIME.get_or_init(Instant::now);

        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install the prometheus recorder")?;

        let services = ResolverServices::new(config.clone())?;
        let router = Self::router(services, Some(metrics));

        // trailing slashes are trimmed before routing so /api/v1/resolve/ still matches
        let app = NormalizePathLayer::trim_trailing_slash().layer(router);

        let address = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {}", address))?;

        info!("resolver listening on {}", address);

        axum::serve(
            listener,
            axum::ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("error while serving")?;

        Ok(())
    }

    pub fn router(services: ResolverServices, metrics: Option<PrometheusHandle>) -> Router {
        let cors = cors_layer(&services.config.cors_origin);
        let max_concurrent_requests = services.config.max_concurrent_requests.max(1);

        let mut router = Router::new()
            .nest("/api/v1/resolve", ResolveController::app())
            .nest("/api/v1/providers/health", HealthController::app());

        if let Some(handle) = metrics {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
            .fallback(|| async { Error::NotFound("route not found".to_string()) })
            .layer(Extension(services))
            .layer(ConcurrencyLimitLayer::new(max_concurrent_requests))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }
}

fn cors_layer(cors_origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::OPTIONS]);

    if cors_origin.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = cors_origin
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring invalid cors origin {:?}", origin);
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        return;
    }
    info!("shutting down");
}
