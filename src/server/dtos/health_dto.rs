use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resolution::ProviderHealth;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// healthy while every provider is up, degraded while at least one is
    pub fn from_providers(providers: &[ProviderHealth]) -> Self {
        let enabled = providers.iter().filter(|p| p.enabled).count();
        match enabled {
            0 => HealthStatus::Unhealthy,
            n if n == providers.len() => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub environment: String,
    pub cached_results: usize,
    pub providers: Vec<ProviderHealth>,
}
