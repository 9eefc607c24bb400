//! Discord bot runtime: gateway session, chat commands and per-channel runs.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use sweep_engine::{
    CancelOutcome, ChannelId, DeleteOutcome, DeletionEngine, EngineConfig, EngineError,
    EventSink, FanoutEventSink, JsonFileCheckpointStore, JsonlEventSink, MessageId,
    RegistryError, RunRegistry, RunSummary, TracingEventSink, UserId,
};
use tokio::{sync::watch, task::JoinSet, time::Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

mod discord_api_client;
mod discord_command_helpers;
mod discord_gateway;
mod discord_permissions;
mod discord_transport_helpers;

pub use discord_api_client::{
    DiscordApiClient, DiscordChannelInfo, DiscordGuildInfo, DISCORD_MAX_HISTORY_LIMIT,
};
pub use discord_command_helpers::{
    parse_sweep_command, parse_user_reference, sweep_command_usage, SweepCommand,
};
pub use discord_gateway::InboundMessage;
pub use discord_permissions::{
    can_manage_messages, compute_channel_permissions, MemberPermissionInput, OverwriteKind,
    PermissionOverwrite, PERMISSION_ADMINISTRATOR, PERMISSION_MANAGE_MESSAGES,
};

use discord_command_helpers::{
    render_status, render_summary, REPLY_ALREADY_RUNNING, REPLY_CANCEL_REQUESTED,
    REPLY_MISSING_PERMISSION, REPLY_NO_ACTIVE_RUN,
};
use discord_gateway::{
    gateway_connect_url, heartbeat_payload, identify_payload, parse_gateway_message,
    GatewayEvent,
};

pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";
pub const CHECKPOINTS_FILE_NAME: &str = "checkpoints.json";
pub const EVENTS_FILE_NAME: &str = "events.jsonl";

#[derive(Clone)]
/// Runtime configuration shared by the bot loop and one-shot purges.
pub struct DiscordSweepRuntimeConfig {
    pub api_base: String,
    /// Overrides the URL announced by `GET /gateway/bot`.
    pub gateway_url: Option<String>,
    pub bot_token: String,
    pub command_prefix: String,
    pub state_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub reconnect_delay: Duration,
    pub engine: EngineConfig,
}

impl DiscordSweepRuntimeConfig {
    pub fn checkpoints_path(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINTS_FILE_NAME)
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join(EVENTS_FILE_NAME)
    }
}

/// Client and engine wired against the state directory.
pub struct SweepServices {
    pub client: Arc<DiscordApiClient>,
    pub engine: DeletionEngine,
}

impl SweepServices {
    pub fn open(config: &DiscordSweepRuntimeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

        let client = Arc::new(DiscordApiClient::new(
            config.api_base.clone(),
            config.bot_token.clone(),
            config.request_timeout_ms,
            config.retry_max_attempts,
            config.retry_base_delay_ms,
        )?);
        let checkpoints = JsonFileCheckpointStore::open(config.checkpoints_path())
            .with_context(|| "failed to open checkpoint store")?;
        let sinks: Vec<Arc<dyn EventSink>> = vec![
            Arc::new(TracingEventSink),
            Arc::new(JsonlEventSink::open(config.events_path())?),
        ];
        let events: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new(sinks));
        let engine = DeletionEngine::new(
            config.engine.clone(),
            client.clone(),
            client.clone(),
            Arc::new(checkpoints),
            events,
        );
        Ok(Self { client, engine })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One-shot purge target.
pub struct PurgeRequest {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub start_from: Option<MessageId>,
}

/// Runs a single purge to completion. Ctrl-C requests cooperative
/// cancellation; the run still finalizes and returns its summary.
pub async fn run_purge(
    config: &DiscordSweepRuntimeConfig,
    request: PurgeRequest,
) -> Result<RunSummary> {
    let services = SweepServices::open(config)?;
    let registry = Arc::new(RunRegistry::new());
    let cancel_registry = Arc::clone(&registry);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(channel = %request.channel_id, "cancellation requested from terminal");
            cancel_registry.request_cancel(request.channel_id);
        }
    });
    let result = purge_with_registry(&services, &registry, request).await;
    ctrl_c.abort();
    result
}

async fn purge_with_registry(
    services: &SweepServices,
    registry: &Arc<RunRegistry>,
    request: PurgeRequest,
) -> Result<RunSummary> {
    let handle = registry.try_start(request.channel_id, request.author_id)?;
    let summary = services
        .engine
        .run(handle, request.start_from)
        .await
        .with_context(|| format!("purge of channel {} failed", request.channel_id))?;
    Ok(summary)
}

/// Connects to the gateway and serves chat commands until Ctrl-C, then
/// cancels every active run and waits for each to finalize.
pub async fn run_discord_bot(config: DiscordSweepRuntimeConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("discord bot shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });
    let mut runtime = DiscordSweepRuntime::new(config)?;
    runtime.run(shutdown_rx).await
}

#[derive(Debug)]
struct FinishedRun {
    run_id: String,
    result: Result<RunSummary, EngineError>,
}

/// Result of one spawned chat command; `run` is set when it started a run.
#[derive(Debug)]
struct CommandTaskResult {
    channel_id: ChannelId,
    run: Option<FinishedRun>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Reconnect,
    Shutdown,
}

enum SessionStep {
    Shutdown,
    Heartbeat,
    Frame(Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>),
    TaskFinished(Result<CommandTaskResult, tokio::task::JoinError>),
}

/// Everything a spawned command task needs; cheap to clone.
#[derive(Clone)]
struct CommandContext {
    command_prefix: String,
    client: Arc<DiscordApiClient>,
    engine: DeletionEngine,
    registry: Arc<RunRegistry>,
}

struct DiscordSweepRuntime {
    config: DiscordSweepRuntimeConfig,
    client: Arc<DiscordApiClient>,
    engine: DeletionEngine,
    registry: Arc<RunRegistry>,
    bot_user_id: Option<UserId>,
    tasks: JoinSet<CommandTaskResult>,
}

impl DiscordSweepRuntime {
    fn new(config: DiscordSweepRuntimeConfig) -> Result<Self> {
        let services = SweepServices::open(&config)?;
        Ok(Self {
            config,
            client: services.client,
            engine: services.engine,
            registry: Arc::new(RunRegistry::new()),
            bot_user_id: None,
            tasks: JoinSet::new(),
        })
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match self.client.resolve_bot_user_id().await {
            Ok(user_id) => self.bot_user_id = Some(user_id),
            Err(error) => tracing::warn!(%error, "failed to resolve bot user id before connecting"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let gateway_url = match self.config.gateway_url.clone() {
                Some(url) => Ok(url),
                None => self.client.resolve_gateway_url().await,
            };
            match gateway_url {
                Ok(url) => match self.run_gateway_session(&url, &mut shutdown).await {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::Reconnect) => {
                        tracing::info!("discord gateway session ended; reconnecting");
                    }
                    Err(error) => tracing::warn!(%error, "discord gateway session error"),
                },
                Err(error) => tracing::warn!(%error, "failed to resolve discord gateway url"),
            }

            while let Some(joined) = self.tasks.try_join_next() {
                log_task_result(joined);
            }
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn run_gateway_session(
        &mut self,
        gateway_url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let (stream, _response) = connect_async(gateway_connect_url(gateway_url))
            .await
            .context("failed to connect discord gateway websocket")?;
        let (mut sink, mut source) = stream.split();
        tracing::info!("discord gateway connected");

        let mut sequence: Option<u64> = None;
        let mut heartbeat_interval: Option<Duration> = None;
        let mut next_heartbeat: Option<Instant> = None;
        let mut awaiting_ack = false;

        loop {
            let step = tokio::select! {
                _ = wait_for_shutdown(shutdown) => SessionStep::Shutdown,
                _ = wait_until(next_heartbeat) => SessionStep::Heartbeat,
                frame = source.next() => SessionStep::Frame(frame),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    SessionStep::TaskFinished(joined)
                }
            };

            match step {
                SessionStep::TaskFinished(joined) => log_task_result(joined),
                SessionStep::Shutdown => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                SessionStep::Heartbeat => {
                    if awaiting_ack {
                        tracing::warn!("discord gateway heartbeat not acknowledged");
                        return Ok(SessionEnd::Reconnect);
                    }
                    sink.send(WsMessage::Text(heartbeat_payload(sequence).to_string().into()))
                        .await
                        .context("failed to send discord heartbeat")?;
                    awaiting_ack = true;
                    next_heartbeat = heartbeat_interval.map(|interval| Instant::now() + interval);
                }
                SessionStep::Frame(None) => return Ok(SessionEnd::Reconnect),
                SessionStep::Frame(Some(frame)) => {
                    let message = frame.context("failed reading discord gateway message")?;
                    let parsed = match parse_gateway_message(message) {
                        Ok(Some(parsed)) => parsed,
                        Ok(None) => continue,
                        Err(error) => {
                            tracing::warn!(%error, "skipping undecodable discord gateway frame");
                            continue;
                        }
                    };
                    if parsed.sequence.is_some() {
                        sequence = parsed.sequence;
                    }
                    match parsed.event {
                        GatewayEvent::Hello {
                            heartbeat_interval: interval,
                        } => {
                            heartbeat_interval = Some(interval);
                            next_heartbeat = Some(Instant::now() + interval);
                            sink.send(WsMessage::Text(
                                identify_payload(&self.config.bot_token).to_string().into(),
                            ))
                            .await
                            .context("failed to send discord identify")?;
                        }
                        GatewayEvent::HeartbeatAck => awaiting_ack = false,
                        GatewayEvent::HeartbeatRequest => {
                            sink.send(WsMessage::Text(
                                heartbeat_payload(sequence).to_string().into(),
                            ))
                            .await
                            .context("failed to send discord heartbeat")?;
                        }
                        GatewayEvent::Ready { bot_user_id } => {
                            tracing::info!(bot_user_id = %bot_user_id, "discord gateway ready");
                            self.bot_user_id = Some(bot_user_id);
                        }
                        GatewayEvent::MessageCreate(inbound) => {
                            self.handle_inbound_message(inbound);
                        }
                        GatewayEvent::Reconnect
                        | GatewayEvent::InvalidSession
                        | GatewayEvent::Closed => return Ok(SessionEnd::Reconnect),
                        GatewayEvent::Dispatch { name } => {
                            tracing::trace!(dispatch = %name, "ignoring discord dispatch");
                        }
                    }
                }
            }
        }
    }

    /// Filters and parses a chat message, then spawns its command so REST
    /// lookups never hold up the gateway loop.
    fn handle_inbound_message(&mut self, inbound: InboundMessage) {
        if inbound.author_is_bot || Some(inbound.message.author_id) == self.bot_user_id {
            return;
        }
        let Some(command) =
            parse_sweep_command(&inbound.message.content, &self.config.command_prefix)
        else {
            return;
        };
        tracing::debug!(
            channel = %inbound.message.channel_id,
            user = %inbound.message.author_id,
            command = ?command,
            "received sweep command"
        );

        let context = CommandContext {
            command_prefix: self.config.command_prefix.clone(),
            client: Arc::clone(&self.client),
            engine: self.engine.clone(),
            registry: Arc::clone(&self.registry),
        };
        self.tasks
            .spawn(async move { context.execute(inbound, command).await });
    }

    async fn drain_tasks(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            log_task_result(joined);
        }
    }

    async fn shutdown(&mut self) {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "waiting for active deletion runs to finish");
        }
        self.drain_tasks().await;
    }
}

impl CommandContext {
    async fn execute(self, inbound: InboundMessage, command: SweepCommand) -> CommandTaskResult {
        let channel_id = inbound.message.channel_id;
        let run = match command {
            SweepCommand::Help => {
                self.reply(channel_id, &sweep_command_usage(&self.command_prefix))
                    .await;
                None
            }
            SweepCommand::Invalid { message } => {
                self.reply(channel_id, &message).await;
                None
            }
            SweepCommand::Status => {
                let status = render_status(self.registry.snapshot(channel_id).as_ref());
                self.reply(channel_id, &status).await;
                None
            }
            SweepCommand::Cancel => {
                if self.authorize(&inbound).await {
                    let reply = match self.registry.request_cancel(channel_id) {
                        CancelOutcome::Requested | CancelOutcome::AlreadyRequested => {
                            tracing::info!(channel = %channel_id, "deletion cancellation requested");
                            REPLY_CANCEL_REQUESTED
                        }
                        CancelOutcome::NoActiveRun => REPLY_NO_ACTIVE_RUN,
                    };
                    self.reply(channel_id, reply).await;
                }
                None
            }
            SweepCommand::Delete { author, start_from } => {
                if self.authorize(&inbound).await {
                    self.start_run(&inbound, author, start_from).await
                } else {
                    None
                }
            }
        };
        CommandTaskResult { channel_id, run }
    }

    async fn start_run(
        &self,
        inbound: &InboundMessage,
        author: UserId,
        start_from: Option<MessageId>,
    ) -> Option<FinishedRun> {
        let channel_id = inbound.message.channel_id;
        let handle = match self.registry.try_start(channel_id, author) {
            Ok(handle) => handle,
            Err(RegistryError::AlreadyRunning { run_id, .. }) => {
                tracing::info!(channel = %channel_id, %run_id, "deletion already in progress");
                self.reply(channel_id, REPLY_ALREADY_RUNNING).await;
                return None;
            }
        };

        match self
            .client
            .delete_message(channel_id, inbound.message.id)
            .await
        {
            DeleteOutcome::Deleted => {}
            outcome => tracing::warn!(
                channel = %channel_id,
                message_id = %inbound.message.id,
                outcome = outcome.as_str(),
                "could not delete command message"
            ),
        }

        let run_id = handle.run_id().to_string();
        tracing::info!(
            channel = %channel_id,
            author = %author,
            %run_id,
            start_from = ?start_from,
            "starting deletion run"
        );
        let result = self.engine.run(handle, start_from).await;
        let reply = match &result {
            Ok(summary) => render_summary(summary),
            Err(error) => format!("Deletion stopped: {error}"),
        };
        self.reply(channel_id, &reply).await;
        Some(FinishedRun { run_id, result })
    }

    /// Replies with a denial and returns false unless the invoking member may
    /// manage messages in the channel.
    async fn authorize(&self, inbound: &InboundMessage) -> bool {
        let allowed = match self.member_can_manage_messages(inbound).await {
            Ok(allowed) => allowed,
            Err(error) => {
                tracing::warn!(
                    channel = %inbound.message.channel_id,
                    user = %inbound.message.author_id,
                    %error,
                    "permission lookup failed"
                );
                false
            }
        };
        if !allowed {
            tracing::info!(
                channel = %inbound.message.channel_id,
                user = %inbound.message.author_id,
                "sweep command denied: missing manage messages permission"
            );
            self.reply(inbound.message.channel_id, REPLY_MISSING_PERMISSION)
                .await;
        }
        allowed
    }

    async fn member_can_manage_messages(&self, inbound: &InboundMessage) -> Result<bool> {
        let Some(guild_id) = inbound.guild_id else {
            return Ok(false);
        };
        let channel = self.client.get_channel(inbound.message.channel_id).await?;
        if channel.guild_id != Some(guild_id) {
            return Ok(false);
        }
        let guild = self.client.get_guild(guild_id).await?;
        let member_roles = match &inbound.member_roles {
            Some(roles) => roles.clone(),
            None => {
                self.client
                    .get_member_roles(guild_id, inbound.message.author_id)
                    .await?
            }
        };
        Ok(can_manage_messages(&MemberPermissionInput {
            guild_id,
            owner_id: guild.owner_id,
            member_id: inbound.message.author_id.get(),
            member_roles: &member_roles,
            role_permissions: &guild.role_permissions,
            channel_overwrites: &channel.overwrites,
        }))
    }

    async fn reply(&self, channel_id: ChannelId, content: &str) {
        if let Err(error) = self.client.post_message(channel_id, content).await {
            tracing::warn!(channel = %channel_id, %error, "failed to post discord reply");
        }
    }
}

fn log_task_result(joined: Result<CommandTaskResult, tokio::task::JoinError>) {
    match joined {
        Ok(CommandTaskResult { run: None, .. }) => {}
        Ok(CommandTaskResult {
            channel_id,
            run:
                Some(FinishedRun {
                    run_id,
                    result: Ok(summary),
                }),
        }) => tracing::info!(
            channel = %channel_id,
            %run_id,
            outcome = summary.outcome.as_str(),
            deleted = summary.counters.deleted,
            examined = summary.counters.examined,
            "deletion run finished"
        ),
        Ok(CommandTaskResult {
            channel_id,
            run:
                Some(FinishedRun {
                    run_id,
                    result: Err(error),
                }),
        }) => tracing::error!(channel = %channel_id, %run_id, %error, "deletion run failed"),
        Err(error) => tracing::error!(%error, "sweep command task join error"),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
