//! followsync, a follower count sync daemon.
//!
//! Periodically scrapes follower counts from configured sources and
//! mirrors them into Discord channel names and topics, staying inside
//! both the scraped sites' undocumented rate limits and Discord's own.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

mod config;
mod discord;
mod extract;
mod fetch;
mod format;
mod pool;
mod poller;
mod retry;
mod throttle;
mod update;

use config::Config;
use discord::DiscordApi;
use fetch::{FetchOrchestrator, HttpMetricProvider};
use pool::SlotPool;
use poller::SyncEngine;
use throttle::ThrottleLedger;
use update::UpdateController;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, default_value = "followsync.json")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "followsync=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    info!("📡 followsync v{}", env!("CARGO_PKG_VERSION"));
    info!(
        sources = config.sources.iter().filter(|s| s.enabled).count(),
        targets = config.targets.len(),
        poll_interval_secs = config.poll_interval_secs,
        "configuration loaded"
    );

    let token = config
        .discord_token()
        .context("Discord bot token not set (config `discord.token` or FOLLOWSYNC_DISCORD_TOKEN)")?;

    let throttle = Arc::new(ThrottleLedger::new());
    let provider = Arc::new(HttpMetricProvider::new(config.fetch.user_agent.as_deref())?);
    let api = Arc::new(DiscordApi::new(&token, &config.discord.api_base)?);

    let fetcher = Arc::new(FetchOrchestrator::new(
        provider,
        throttle,
        SlotPool::new("fetch", config.fetch.max_concurrent),
        config.fetch.retry_policy(),
    ));
    let updater = Arc::new(UpdateController::new(
        api,
        SlotPool::new("edit", config.edit.max_concurrent),
        config.edit.retry_policy(),
    ));

    let engine = Arc::new(SyncEngine::new(&config, fetcher, updater));
    let period = config.poll_interval();

    tokio::select! {
        _ = poller::run(engine, period) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping");
        }
    }

    Ok(())
}
