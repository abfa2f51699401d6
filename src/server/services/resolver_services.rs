use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::{
    config::AppConfig,
    resolution::{
        DynHttpClient, DynSubtitleService, HttpSubtitleService, ProviderRegistry, ReqwestHttpClient,
        ResolutionOrchestrator, ResultCache,
    },
    server::utils::signature_utils::SignatureUtil,
};

use super::playback_proxy_services::{DirectPlayback, DynPlaybackProxy, SignedProxyRewriter};

/// everything a handler needs, cloned into every request through an Extension
#[derive(Clone)]
pub struct ResolverServices {
    pub orchestrator: Arc<ResolutionOrchestrator>,
    pub playback: DynPlaybackProxy,
    pub config: Arc<AppConfig>,
}

impl ResolverServices {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        info!("loading providers from {}...", config.providers_file.display());

        let registry = ProviderRegistry::from_file(&config.providers_file, config.breaker_config())
            .with_context(|| {
                format!(
                    "failed to build the provider registry from {}",
                    config.providers_file.display()
                )
            })?;

        info!("{} providers loaded, starting remaining services...", registry.len());

        let http = Arc::new(
            ReqwestHttpClient::new(&config.user_agent).context("failed to build the upstream http client")?,
        ) as DynHttpClient;

        let subtitles = config.subtitle_service_url.as_ref().map(|base_url| {
            Arc::new(HttpSubtitleService::new(
                http.clone(),
                base_url.clone(),
                Duration::from_millis(config.hop_timeout_ms),
            )) as DynSubtitleService
        });

        let signature_util = Arc::new(SignatureUtil::new(config.access_token_secret.clone()));
        let playback = match &config.playback_proxy_url {
            Some(base_url) => {
                info!("playback urls go through {}", base_url);
                Arc::new(SignedProxyRewriter::new(base_url.clone(), signature_util)) as DynPlaybackProxy
            }
            None => Arc::new(DirectPlayback) as DynPlaybackProxy,
        };

        let orchestrator = ResolutionOrchestrator::new(
            Arc::new(registry),
            http,
            Arc::new(ResultCache::new(config.cache_ttl())),
            subtitles,
            config.resolver_config(),
        );

        Ok(Self::from_parts(Arc::new(orchestrator), playback, config))
    }

    pub fn from_parts(
        orchestrator: Arc<ResolutionOrchestrator>,
        playback: DynPlaybackProxy,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            orchestrator,
            playback,
            config,
        }
    }
}
