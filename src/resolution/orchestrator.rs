use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::resolution::{
    cache::{CacheKey, ResultCache},
    descriptor::ProviderDescriptor,
    error::{AggregateResolutionError, ProviderAttempt, ResolutionError},
    http::DynHttpClient,
    models::{ProviderHealth, ResolutionRequest, ResolutionResult, Subtitle},
    normalize::build_result,
    registry::ProviderRegistry,
    subtitles::DynSubtitleService,
    walker::HopChainWalker,
};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub hop_timeout: Duration,
    /// budget for one provider's whole hop chain plus decode
    pub provider_timeout: Duration,
    pub resolve_deadline: Duration,
    /// providers in flight at once, 1 means strictly sequential
    pub race_width: usize,
    /// extra tries on transient failures only
    pub upstream_retries: u32,
    pub retry_backoff: Duration,
    /// expiry used when the manifest url carries none
    pub default_expiry: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            hop_timeout: Duration::from_secs(5),
            provider_timeout: Duration::from_secs(15),
            resolve_deadline: Duration::from_secs(30),
            race_width: 2,
            upstream_retries: 1,
            retry_backoff: Duration::from_millis(250),
            default_expiry: Duration::from_secs(600),
        }
    }
}

struct ProviderSuccess {
    result: ResolutionResult,
    derived_keys: Vec<(usize, Vec<u8>)>,
}

struct AttemptOutcome {
    rank: usize,
    provider_key: String,
    tries: u32,
    result: Result<ProviderSuccess, ResolutionError>,
}

pub struct ResolutionOrchestrator {
    registry: Arc<ProviderRegistry>,
    walker: HopChainWalker,
    cache: Arc<ResultCache>,
    subtitles: Option<DynSubtitleService>,
    config: ResolverConfig,
}

impl ResolutionOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        http: DynHttpClient,
        cache: Arc<ResultCache>,
        subtitles: Option<DynSubtitleService>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            walker: HopChainWalker::new(http, config.hop_timeout),
            registry,
            cache,
            subtitles,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn list_provider_health(&self) -> Vec<ProviderHealth> {
        self.registry.health()
    }

    /// Resolves a request to a playable manifest. Providers are tried in priority order, up to
    /// `race_width` at a time; the first validated result wins and whatever is still in flight is
    /// dropped. Callers only ever see the result or one aggregate failure.
    pub async fn resolve(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolutionResult, AggregateResolutionError> {
        let providers = self.registry.list_enabled(true);

        if let Some(cached) = self
            .cache
            .lookup(request, providers.iter().map(|p| p.provider_key.as_str()))
        {
            debug!(
                "cache hit for {} via {}",
                request.content_id, cached.provider_key
            );
            metrics::counter!("resolver_cache_hits_total").increment(1);
            return Ok(cached);
        }

        if providers.is_empty() {
            warn!("no enabled providers to resolve {}", request.content_id);
            return Err(AggregateResolutionError {
                attempts: Vec::new(),
                deadline_exceeded: false,
            });
        }

        let deadline_at = Instant::now() + self.config.resolve_deadline;
        let deadline = sleep_until(deadline_at);
        tokio::pin!(deadline);

        let mut pending: VecDeque<(usize, Arc<ProviderDescriptor>)> =
            providers.into_iter().enumerate().collect();
        let mut in_flight = FuturesUnordered::new();
        let mut outstanding: Vec<(usize, String)> = Vec::new();
        let mut attempts: Vec<(usize, ProviderAttempt)> = Vec::new();
        let mut deadline_exceeded = false;
        let mut winner = None;
        let race_width = self.config.race_width.max(1);

        loop {
            while in_flight.len() < race_width {
                let Some((rank, descriptor)) = pending.pop_front() else {
                    break;
                };
                outstanding.push((rank, descriptor.provider_key.clone()));
                in_flight.push(self.attempt_provider(rank, descriptor, request));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(outcome) = in_flight.next() => {
                    outstanding.retain(|(rank, _)| *rank != outcome.rank);
                    match outcome.result {
                        Ok(success) => {
                            winner = Some(success);
                            break;
                        }
                        Err(error) => {
                            self.registry.record_failure(&outcome.provider_key, &error);
                            attempts.push((
                                outcome.rank,
                                ProviderAttempt {
                                    provider_key: outcome.provider_key,
                                    tries: outcome.tries,
                                    error,
                                },
                            ));
                        }
                    }
                }
                _ = &mut deadline => {
                    warn!(
                        "resolve deadline of {:?} hit for {} with {} attempts outstanding",
                        self.config.resolve_deadline,
                        request.content_id,
                        outstanding.len()
                    );
                    deadline_exceeded = true;
                    break;
                }
            }
        }

        // losers and their requests go away here, before any post processing of the winner
        drop(in_flight);

        if let Some(success) = winner {
            for (_, provider_key) in outstanding {
                metrics::counter!("resolver_attempts_total", "provider" => provider_key, "outcome" => "cancelled")
                    .increment(1);
            }
            return Ok(self.accept(request, success, deadline_at).await);
        }

        for (rank, provider_key) in outstanding {
            metrics::counter!("resolver_attempts_total", "provider" => provider_key.clone(), "outcome" => "cancelled")
                .increment(1);
            attempts.push((
                rank,
                ProviderAttempt {
                    provider_key,
                    tries: 1,
                    error: ResolutionError::Cancelled,
                },
            ));
        }

        attempts.sort_by_key(|(rank, _)| *rank);
        let attempts: Vec<ProviderAttempt> = attempts.into_iter().map(|(_, a)| a).collect();

        error!(
            "failed to resolve {}: {}",
            request.content_id,
            attempts
                .iter()
                .map(|a| format!("{}={}", a.provider_key, a.error.kind()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Err(AggregateResolutionError {
            attempts,
            deadline_exceeded,
        })
    }

    /// bookkeeping for the winning attempt, nothing here can fail the resolution
    async fn accept(
        &self,
        request: &ResolutionRequest,
        success: ProviderSuccess,
        deadline_at: Instant,
    ) -> ResolutionResult {
        let ProviderSuccess {
            mut result,
            derived_keys,
        } = success;

        self.registry.record_success(&result.provider_key);
        self.registry
            .store_derived_keys(&result.provider_key, derived_keys);

        // the subtitle lookup shares whatever is left of the resolve deadline
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if let Some(subtitles) = &self.subtitles {
            if remaining.is_zero() {
                debug!("no time left to fetch subtitles for {}", request.content_id);
            } else {
                match timeout(self.config.hop_timeout.min(remaining), subtitles.fetch(request)).await {
                    Ok(Ok(extra)) => merge_subtitles(&mut result.subtitles, extra),
                    Ok(Err(e)) => warn!("failed to fetch subtitles for {}: {}", request.content_id, e),
                    Err(_) => warn!("subtitle lookup for {} timed out", request.content_id),
                }
            }
        }

        self.cache
            .insert(CacheKey::new(request, &result.provider_key), result.clone());

        info!(
            "resolved {} via {}",
            request.content_id, result.provider_key
        );
        result
    }

    /// One provider with its retry budget. Only transient failures are retried, with a jittered backoff.
    async fn attempt_provider(
        &self,
        rank: usize,
        descriptor: Arc<ProviderDescriptor>,
        request: &ResolutionRequest,
    ) -> AttemptOutcome {
        let provider_key = descriptor.provider_key.clone();
        let mut tries = 0;

        loop {
            tries += 1;
            let result = match timeout(
                self.config.provider_timeout,
                self.attempt_once(&descriptor, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ResolutionError::Timeout(self.config.provider_timeout)),
            };

            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.kind(),
            };
            metrics::counter!("resolver_attempts_total", "provider" => provider_key.clone(), "outcome" => outcome)
                .increment(1);

            match result {
                Err(e) if e.is_retryable() && tries <= self.config.upstream_retries => {
                    let backoff = self.retry_delay();
                    warn!(
                        "{} attempt {} failed ({}), retrying in {:?}",
                        provider_key, tries, e, backoff
                    );
                    sleep(backoff).await;
                }
                result => {
                    if let Err(e) = &result {
                        info!("{} gave up after {} tries: {}", provider_key, tries, e);
                    }
                    return AttemptOutcome {
                        rank,
                        provider_key,
                        tries,
                        result,
                    };
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        descriptor: &ProviderDescriptor,
        request: &ResolutionRequest,
    ) -> Result<ProviderSuccess, ResolutionError> {
        let walk = self.walker.walk(&descriptor.hop_chain, request).await?;

        let keys = self.registry.keyring(&descriptor.provider_key);
        let decoded = descriptor.pipeline().run(&walk.payload, &keys)?;

        let result = build_result(descriptor, &decoded, &walk, self.config.default_expiry);
        Ok(ProviderSuccess {
            result,
            derived_keys: decoded.derived_keys,
        })
    }

    fn retry_delay(&self) -> Duration {
        let base = self.config.retry_backoff.as_millis() as u64;
        let jitter = if base == 0 {
            0
        } else {
            rand::rng().random_range(0..=base / 2)
        };
        Duration::from_millis(base + jitter)
    }
}

/// appends subtitles we don't already have, by url
fn merge_subtitles(existing: &mut Vec<Subtitle>, extra: Vec<Subtitle>) {
    let mut seen: HashSet<String> = existing.iter().map(|s| s.url.clone()).collect();
    for subtitle in extra {
        if seen.insert(subtitle.url.clone()) {
            existing.push(subtitle);
        }
    }
}
