use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sweep_discord_runtime::{parse_user_reference, DEFAULT_DISCORD_API_BASE};
use sweep_engine::{ChannelId, MessageId, UserId};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_channel_id(value: &str) -> Result<ChannelId, String> {
    value
        .parse::<ChannelId>()
        .map_err(|error| format!("invalid channel id '{value}': {error}"))
}

fn parse_message_id(value: &str) -> Result<MessageId, String> {
    value
        .parse::<MessageId>()
        .map_err(|error| format!("invalid message id '{value}': {error}"))
}

fn parse_author(value: &str) -> Result<UserId, String> {
    parse_user_reference(value)
        .ok_or_else(|| format!("invalid user '{value}': expected <@id>, <@!id> or a numeric id"))
}

#[derive(Debug, Parser)]
#[command(
    name = "sweep",
    about = "Bulk-delete one user's messages from Discord channels",
    version
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Connect to the Discord gateway and serve `!d` / `!cancel` chat commands.
    Bot,
    /// Run one deletion directly against a channel and print its summary.
    Purge(PurgeArgs),
    /// Inspect or clear saved resume points.
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointsCommand,
    },
}

#[derive(Debug, Args)]
pub(crate) struct PurgeArgs {
    #[arg(long, value_parser = parse_channel_id, help = "Channel to sweep")]
    pub channel: ChannelId,

    #[arg(
        long,
        value_parser = parse_author,
        help = "Author whose messages are deleted (<@id>, <@!id> or numeric id)"
    )]
    pub author: UserId,

    #[arg(
        long = "start-from",
        value_parser = parse_message_id,
        help = "Only consider messages older than this message id"
    )]
    pub start_from: Option<MessageId>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CheckpointsCommand {
    /// Print every saved checkpoint.
    List,
    /// Remove the checkpoint of one channel.
    Clear {
        #[arg(long, value_parser = parse_channel_id)]
        channel: ChannelId,
    },
}

#[derive(Debug, Args)]
pub(crate) struct RuntimeArgs {
    #[arg(
        long = "discord-token",
        env = "SWEEP_DISCORD_TOKEN",
        hide_env_values = true,
        global = true,
        help = "Discord bot token (falls back to the TOKEN environment variable)"
    )]
    pub discord_token: Option<String>,

    #[arg(
        long = "discord-api-base",
        env = "SWEEP_DISCORD_API_BASE",
        default_value = DEFAULT_DISCORD_API_BASE,
        global = true,
        help = "Discord REST API base URL"
    )]
    pub discord_api_base: String,

    #[arg(
        long = "discord-gateway-url",
        env = "SWEEP_DISCORD_GATEWAY_URL",
        global = true,
        help = "Gateway websocket URL; resolved through GET /gateway/bot when omitted"
    )]
    pub discord_gateway_url: Option<String>,

    #[arg(
        long = "command-prefix",
        env = "SWEEP_COMMAND_PREFIX",
        default_value = "!",
        global = true,
        help = "Prefix that marks chat messages as bot commands"
    )]
    pub command_prefix: String,

    #[arg(
        long = "request-timeout-ms",
        env = "SWEEP_REQUEST_TIMEOUT_MS",
        default_value_t = 20_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Timeout for a single Discord HTTP request"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "retry-max-attempts",
        env = "SWEEP_RETRY_MAX_ATTEMPTS",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        global = true,
        help = "Attempts for retryable history and lookup requests (deletes are never retried)"
    )]
    pub retry_max_attempts: usize,

    #[arg(
        long = "retry-base-delay-ms",
        env = "SWEEP_RETRY_BASE_DELAY_MS",
        default_value_t = 500,
        value_parser = parse_positive_u64,
        global = true,
        help = "Base exponential backoff between request retries"
    )]
    pub retry_base_delay_ms: u64,

    #[arg(
        long = "page-size",
        env = "SWEEP_PAGE_SIZE",
        default_value_t = 1_000,
        value_parser = parse_positive_usize,
        global = true,
        help = "Messages fetched per engine page"
    )]
    pub page_size: usize,

    #[arg(
        long = "checkpoint-interval",
        env = "SWEEP_CHECKPOINT_INTERVAL",
        default_value_t = 1_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Save a checkpoint every N examined messages"
    )]
    pub checkpoint_interval: u64,

    #[arg(
        long = "pacing-delay-ms",
        env = "SWEEP_PACING_DELAY_MS",
        default_value_t = 1_000,
        global = true,
        help = "Pause after each successful delete"
    )]
    pub pacing_delay_ms: u64,

    #[arg(
        long = "rate-limit-backoff-ms",
        env = "SWEEP_RATE_LIMIT_BACKOFF_MS",
        default_value_t = 1_000,
        global = true,
        help = "Backoff after a rate-limited delete that carried no retry hint"
    )]
    pub rate_limit_backoff_ms: u64,

    #[arg(
        long = "state-dir",
        env = "SWEEP_STATE_DIR",
        default_value = ".sweep",
        global = true,
        help = "Directory holding checkpoints.json and events.jsonl"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "reconnect-delay-ms",
        env = "SWEEP_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Delay before reconnecting a dropped gateway session"
    )]
    pub reconnect_delay_ms: u64,
}
