use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use resolver::{AppConfig, Logger, ResolverApplicationServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards are kept alive to flush logs and keep the sentry client around
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!(
        "logger and env prepped, resolver v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    ResolverApplicationServer::serve(config)
        .await
        .context("resolver server failed")?;

    Ok(())
}
