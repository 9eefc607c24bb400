use std::time::Duration;

use anyhow::{bail, Result};
use sweep_discord_runtime::DiscordSweepRuntimeConfig;
use sweep_engine::EngineConfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::RuntimeArgs;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Explicit flag or `SWEEP_DISCORD_TOKEN` first, then the bare `TOKEN`
/// variable the bot has always honored.
pub(crate) fn resolve_bot_token(
    explicit: Option<&str>,
    legacy_env: Option<String>,
) -> Result<String> {
    let token = explicit
        .map(str::to_string)
        .or(legacy_env)
        .map(|token| token.trim().to_string())
        .unwrap_or_default();
    if token.is_empty() {
        bail!("a discord bot token is required: pass --discord-token or set SWEEP_DISCORD_TOKEN");
    }
    Ok(token)
}

pub(crate) fn engine_config_from_args(args: &RuntimeArgs) -> EngineConfig {
    EngineConfig {
        page_size: args.page_size,
        checkpoint_interval: args.checkpoint_interval,
        pacing_delay: Duration::from_millis(args.pacing_delay_ms),
        rate_limit_backoff: Duration::from_millis(args.rate_limit_backoff_ms),
    }
    .normalized()
}

pub(crate) fn runtime_config_from_args(
    args: &RuntimeArgs,
    bot_token: String,
) -> DiscordSweepRuntimeConfig {
    DiscordSweepRuntimeConfig {
        api_base: args.discord_api_base.clone(),
        gateway_url: args
            .discord_gateway_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string),
        bot_token,
        command_prefix: args.command_prefix.clone(),
        state_dir: args.state_dir.clone(),
        request_timeout_ms: args.request_timeout_ms,
        retry_max_attempts: args.retry_max_attempts,
        retry_base_delay_ms: args.retry_base_delay_ms,
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        engine: engine_config_from_args(args),
    }
}
