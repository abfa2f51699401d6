use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::resolution::{
    descriptor::{DescriptorError, ProviderDescriptor, load_descriptors},
    error::ResolutionError,
    models::ProviderHealth,
    pipeline::KeyRing,
};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// validation failures inside the window before the provider is disabled
    pub failure_threshold: usize,
    pub failure_window: Duration,
    pub disable_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(300),
            disable_duration: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    /// the static flag from the descriptor, an operator switch rather than the breaker
    enabled: bool,
    disabled_until: Option<Instant>,
    validation_failures: VecDeque<Instant>,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
}

impl ProviderState {
    fn is_available(&self, now: Instant) -> bool {
        self.enabled && self.disabled_until.is_none_or(|until| now >= until)
    }

    fn disable_lapsed(&self, now: Instant) -> bool {
        self.disabled_until.is_some_and(|until| now >= until)
    }
}

/// Provider key -> descriptor, built once. The only mutable parts are the per-provider breaker state
/// and derived keystreams, a stale read there costs at most one wasted attempt.
pub struct ProviderRegistry {
    descriptors: HashMap<String, Arc<ProviderDescriptor>>,
    state: RwLock<HashMap<String, ProviderState>>,
    keystreams: RwLock<HashMap<String, KeyRing>>,
    breaker: BreakerConfig,
}

impl ProviderRegistry {
    pub fn new(
        descriptors: Vec<ProviderDescriptor>,
        breaker: BreakerConfig,
    ) -> Result<Self, DescriptorError> {
        let mut by_key = HashMap::with_capacity(descriptors.len());
        let mut state = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            descriptor.validate()?;
            let key = descriptor.provider_key.clone();
            if by_key.contains_key(&key) {
                return Err(DescriptorError::DuplicateKey(key));
            }
            state.insert(
                key.clone(),
                ProviderState {
                    enabled: descriptor.enabled,
                    ..Default::default()
                },
            );
            by_key.insert(key, Arc::new(descriptor));
        }

        info!("provider registry ready with {} providers", by_key.len());

        Ok(Self {
            descriptors: by_key,
            state: RwLock::new(state),
            keystreams: RwLock::new(HashMap::new()),
            breaker,
        })
    }

    pub fn from_file(path: &Path, breaker: BreakerConfig) -> anyhow::Result<Self> {
        let descriptors = load_descriptors(path)?;
        Ok(Self::new(descriptors, breaker)?)
    }

    pub fn get(&self, provider_key: &str) -> Option<Arc<ProviderDescriptor>> {
        self.descriptors.get(provider_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Enabled providers, lowest priority value first when sorted (ties broken by key so the order is
    /// stable between calls).
    pub fn list_enabled(&self, sorted_by_priority: bool) -> Vec<Arc<ProviderDescriptor>> {
        let now = Instant::now();
        self.clear_lapsed_disables(now);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let mut enabled: Vec<Arc<ProviderDescriptor>> = self
            .descriptors
            .values()
            .filter(|d| {
                state
                    .get(&d.provider_key)
                    .map(|s| s.is_available(now))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if sorted_by_priority {
            enabled.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.provider_key.cmp(&b.provider_key))
            });
        }
        enabled
    }

    /// Lapsed disables are only housekeeping, readers already treat them as enabled. The write lock is
    /// taken only when there is one to clear.
    fn clear_lapsed_disables(&self, now: Instant) {
        let any_lapsed = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|s| s.disable_lapsed(now));
        if !any_lapsed {
            return;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for (provider_key, provider) in state.iter_mut() {
            if provider.disable_lapsed(now) {
                provider.disabled_until = None;
                info!("provider {} is back after its disable ran out", provider_key);
            }
        }
    }

    /// Soft, time-bounded disable. Returns false for unknown providers.
    pub fn disable(&self, provider_key: &str) -> bool {
        self.disable_for(provider_key, self.breaker.disable_duration)
    }

    pub fn disable_for(&self, provider_key: &str, duration: Duration) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.get_mut(provider_key) {
            Some(provider) => {
                provider.disabled_until = Some(Instant::now() + duration);
                warn!("provider {} disabled for {:?}", provider_key, duration);
                metrics::counter!("resolver_provider_disabled_total", "provider" => provider_key.to_string())
                    .increment(1);
                true
            }
            None => false,
        }
    }

    /// lifts a soft disable, the static flag from the descriptor still applies
    pub fn enable(&self, provider_key: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.get_mut(provider_key) {
            Some(provider) => {
                provider.disabled_until = None;
                provider.validation_failures.clear();
                true
            }
            None => false,
        }
    }

    pub fn record_success(&self, provider_key: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = state.get_mut(provider_key) {
            provider.last_success = Some(Utc::now());
            provider.validation_failures.clear();
        }
    }

    /// Records a failed attempt. Validation failures feed the breaker: a repeat inside the window drops
    /// derived keystreams, hitting the threshold disables the provider.
    pub fn record_failure(&self, provider_key: &str, error: &ResolutionError) {
        let now = Instant::now();
        let (recurring, tripped) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(provider) = state.get_mut(provider_key) else {
                return;
            };
            provider.last_error = Some(error.to_string());

            if !error.is_validation_failure() {
                return;
            }

            let window = self.breaker.failure_window;
            provider.validation_failures.push_back(now);
            while let Some(oldest) = provider.validation_failures.front() {
                if now.duration_since(*oldest) > window {
                    provider.validation_failures.pop_front();
                } else {
                    break;
                }
            }

            let count = provider.validation_failures.len();
            let tripped = count >= self.breaker.failure_threshold.max(1);
            if tripped {
                provider.validation_failures.clear();
            }
            (count >= 2, tripped)
        };

        if recurring || tripped {
            self.invalidate_keystreams(provider_key);
        }
        if tripped {
            warn!(
                "provider {} failed validation {} times within {:?}",
                provider_key, self.breaker.failure_threshold, self.breaker.failure_window
            );
            self.disable(provider_key);
        }
    }

    pub fn keyring(&self, provider_key: &str) -> KeyRing {
        self.keystreams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn store_derived_keys(&self, provider_key: &str, keys: Vec<(usize, Vec<u8>)>) {
        if keys.is_empty() {
            return;
        }
        let mut keystreams = self.keystreams.write().unwrap_or_else(PoisonError::into_inner);
        let ring = keystreams.entry(provider_key.to_string()).or_default();
        for (step_index, key) in keys {
            info!(
                "keeping a {} byte keystream for {} step {}",
                key.len(),
                provider_key,
                step_index
            );
            ring.insert(step_index, key);
        }
    }

    pub fn invalidate_keystreams(&self, provider_key: &str) {
        let removed = self
            .keystreams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_key);
        if removed.is_some() {
            info!("dropped derived keystreams for {}", provider_key);
        }
    }

    /// snapshot for diagnostics, sorted by priority
    pub fn health(&self) -> Vec<ProviderHealth> {
        let now = Instant::now();
        self.clear_lapsed_disables(now);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let mut health: Vec<ProviderHealth> = self
            .descriptors
            .values()
            .filter_map(|descriptor| {
                let provider = state.get(&descriptor.provider_key)?;
                Some(ProviderHealth {
                    provider_key: descriptor.provider_key.clone(),
                    priority: descriptor.priority,
                    enabled: provider.is_available(now),
                    disabled_for_secs: provider
                        .disabled_until
                        .filter(|until| now < *until)
                        .map(|until| until.saturating_duration_since(now).as_secs()),
                    last_error: provider.last_error.clone(),
                    last_success: provider.last_success,
                    recent_validation_failures: provider.validation_failures.len(),
                })
            })
            .collect();

        health.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.provider_key.cmp(&b.provider_key))
        });
        health
    }
}
