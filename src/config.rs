use std::path::PathBuf;
use std::time::Duration;

use crate::resolution::{BreakerConfig, ResolverConfig};

#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // either * or a comma separated list of origins like example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,

    // json file with every provider descriptor, read once at startup
    #[clap(long, env, default_value = "providers.json")]
    pub providers_file: PathBuf,

    // resolved manifests usually carry short lived tokens, keep this low
    #[clap(long, env, default_value = "300")]
    pub cache_ttl_secs: u64,

    #[clap(long, env, default_value = "5000")]
    pub hop_timeout_ms: u64,

    // whole hop chain plus decode for one provider
    #[clap(long, env, default_value = "15000")]
    pub provider_timeout_ms: u64,

    #[clap(long, env, default_value = "30000")]
    pub resolve_deadline_ms: u64,

    // how many providers are tried at the same time
    #[clap(long, env, default_value = "2")]
    pub race_width: usize,

    #[clap(long, env, default_value = "1")]
    pub upstream_retries: u32,

    #[clap(long, env, default_value = "250")]
    pub retry_backoff_ms: u64,

    #[clap(long, env, default_value = "3")]
    pub validation_failure_threshold: usize,

    #[clap(long, env, default_value = "300")]
    pub validation_failure_window_secs: u64,

    #[clap(long, env, default_value = "600")]
    pub provider_disable_secs: u64,

    // sent on every hop, most embeds refuse obvious bot agents
    #[clap(
        long,
        env,
        default_value = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
    )]
    pub user_agent: String,

    // base url of the playback proxy, manifests are returned as is when unset
    #[clap(long, env)]
    pub playback_proxy_url: Option<String>,

    // signs playback proxy urls, have it be anything secure like 'openssl rand -base64 32'
    #[clap(long, env)]
    pub access_token_secret: String,

    #[clap(long, env)]
    pub subtitle_service_url: Option<String>,

    #[clap(long, env, default_value = "256")]
    pub max_concurrent_requests: usize,
}

impl AppConfig {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            hop_timeout: Duration::from_millis(self.hop_timeout_ms),
            provider_timeout: Duration::from_millis(self.provider_timeout_ms),
            resolve_deadline: Duration::from_millis(self.resolve_deadline_ms),
            race_width: self.race_width,
            upstream_retries: self.upstream_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..Default::default()
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.validation_failure_threshold,
            failure_window: Duration::from_secs(self.validation_failure_window_secs),
            disable_duration: Duration::from_secs(self.provider_disable_secs),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for AppConfig {
    // mostly for tests, real values come from the env
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            cors_origin: "*".to_string(),
            sentry_dsn: None,
            providers_file: PathBuf::from("providers.json"),
            cache_ttl_secs: 300,
            hop_timeout_ms: 5000,
            provider_timeout_ms: 15000,
            resolve_deadline_ms: 30000,
            race_width: 2,
            upstream_retries: 1,
            retry_backoff_ms: 250,
            validation_failure_threshold: 3,
            validation_failure_window_secs: 300,
            provider_disable_secs: 600,
            user_agent: "Mozilla/5.0".to_string(),
            playback_proxy_url: None,
            access_token_secret: "default-access-secret".to_string(),
            subtitle_service_url: None,
            max_concurrent_requests: 256,
        }
    }
}
