use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use crate::resolution::models::{MediaType, ResolutionRequest, ResolutionResult};

/// manifest urls routinely carry ip or time bound tokens, keep this in minutes
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_id: String,
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub provider_key: String,
}

impl CacheKey {
    pub fn new(request: &ResolutionRequest, provider_key: &str) -> Self {
        Self {
            content_id: request.content_id.clone(),
            media_type: request.media_type,
            season: request.season,
            episode: request.episode,
            provider_key: provider_key.to_string(),
        }
    }
}

struct CacheEntry {
    result: ResolutionResult,
    expires_at: Instant,
}

/// In-memory TTL map. Expired entries are evicted when someone looks them up, nothing sweeps.
pub struct ResultCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<ResolutionResult> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.result.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // expired, take the write lock and re-check since another caller may have refreshed it
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            debug!("evicting expired result for {:?}", key);
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.result.clone())
    }

    /// first live entry for the request among the given providers, in the order given
    pub fn lookup<'a>(
        &self,
        request: &ResolutionRequest,
        provider_keys: impl IntoIterator<Item = &'a str>,
    ) -> Option<ResolutionResult> {
        provider_keys
            .into_iter()
            .find_map(|provider_key| self.get(&CacheKey::new(request, provider_key)))
    }

    /// Stores a result for at most the ttl, less when the result says it expires sooner.
    pub fn insert(&self, key: CacheKey, result: ResolutionResult) {
        let until_result_expires = (result.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let lifetime = self.ttl.min(until_result_expires);
        if lifetime.is_zero() {
            return;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            CacheEntry {
                result,
                expires_at: Instant::now() + lifetime,
            },
        );
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
    }
}
