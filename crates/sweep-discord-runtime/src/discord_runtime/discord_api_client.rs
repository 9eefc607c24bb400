//! Discord REST client backing history paging, deletes and command replies.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sweep_engine::{ChannelId, ChannelLog, DeleteOutcome, Message, MessageId, MessageStore, UserId};

use super::discord_permissions::{OverwriteKind, PermissionOverwrite};
use super::discord_transport_helpers::{
    is_retryable_discord_status, is_retryable_transport_error, parse_retry_after,
    parse_snowflake, rate_limit_retry_after, retry_delay, truncate_for_error,
};

/// Discord caps a single history request at this many messages.
pub const DISCORD_MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize)]
struct DiscordUserPayload {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordMessagePayload {
    id: String,
    channel_id: String,
    author: DiscordUserPayload,
    #[serde(default)]
    content: String,
}

impl DiscordMessagePayload {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: MessageId(parse_snowflake("message.id", &self.id)?),
            channel_id: ChannelId(parse_snowflake("message.channel_id", &self.channel_id)?),
            author_id: UserId(parse_snowflake("message.author.id", &self.author.id)?),
            content: self.content,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordGatewayBotResponse {
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordGuildPayload {
    owner_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordRolePayload {
    id: String,
    permissions: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordMemberPayload {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordOverwritePayload {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordChannelPayload {
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    permission_overwrites: Vec<DiscordOverwritePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Channel metadata needed for permission checks.
pub struct DiscordChannelInfo {
    pub guild_id: Option<u64>,
    pub overwrites: Vec<PermissionOverwrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Guild ownership and role permission bits.
pub struct DiscordGuildInfo {
    pub guild_id: u64,
    pub owner_id: u64,
    pub role_permissions: Vec<(u64, u64)>,
}

#[derive(Clone)]
pub struct DiscordApiClient {
    http: reqwest::Client,
    api_base: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl DiscordApiClient {
    pub fn new(
        api_base: String,
        bot_token: String,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(
                "DiscordBot (https://github.com/sweep-rs/sweep, 0.1)",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let auth_header = format!("Bot {}", bot_token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid discord authorization header")?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create discord api client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    pub async fn resolve_bot_user_id(&self) -> Result<UserId> {
        let user: DiscordUserPayload = self
            .request_json("get current user", || {
                self.http.get(format!("{}/users/@me", self.api_base))
            })
            .await?;
        Ok(UserId(parse_snowflake("user.id", &user.id)?))
    }

    pub async fn resolve_gateway_url(&self) -> Result<String> {
        let response: DiscordGatewayBotResponse = self
            .request_json("get gateway bot", || {
                self.http.get(format!("{}/gateway/bot", self.api_base))
            })
            .await?;
        let url = response.url.trim().to_string();
        if url.is_empty() {
            bail!("discord gateway/bot returned an empty url");
        }
        Ok(url)
    }

    /// One history request, newest first, capped at Discord's per-request limit.
    pub async fn list_messages(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let limit_value = limit.clamp(1, DISCORD_MAX_HISTORY_LIMIT).to_string();
        let before_value = before.map(|id| id.to_string());
        let rows: Vec<DiscordMessagePayload> = self
            .request_json("list channel messages", || {
                let mut request = self
                    .http
                    .get(format!("{}/channels/{}/messages", self.api_base, channel))
                    .query(&[("limit", limit_value.as_str())]);
                if let Some(before_value) = before_value.as_deref() {
                    request = request.query(&[("before", before_value)]);
                }
                request
            })
            .await?;
        rows.into_iter()
            .map(DiscordMessagePayload::into_message)
            .collect()
    }

    /// Assembles one engine page of up to `limit` messages from as many
    /// history requests as needed.
    pub async fn fetch_history_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let limit = limit.max(1);
        let mut rows = Vec::with_capacity(limit.min(DISCORD_MAX_HISTORY_LIMIT * 10));
        let mut cursor = before;
        while rows.len() < limit {
            let chunk_limit = (limit - rows.len()).min(DISCORD_MAX_HISTORY_LIMIT);
            let chunk = self.list_messages(channel, cursor, chunk_limit).await?;
            let chunk_len = chunk.len();
            if let Some(oldest) = chunk.iter().map(|message| message.id).min() {
                cursor = Some(oldest);
            }
            rows.extend(chunk);
            if chunk_len < chunk_limit {
                break;
            }
        }
        Ok(rows)
    }

    /// Single delete attempt; never retried here so the engine can apply its
    /// own pacing and backoff.
    pub async fn delete_message(&self, channel: ChannelId, message_id: MessageId) -> DeleteOutcome {
        let response = self
            .http
            .delete(format!(
                "{}/channels/{}/messages/{}",
                self.api_base, channel, message_id
            ))
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                return DeleteOutcome::Failed {
                    reason: format!("discord delete request failed: {error}"),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            return DeleteOutcome::Deleted;
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            429 => DeleteOutcome::RateLimited {
                retry_after: rate_limit_retry_after(&headers, &body),
            },
            403 => DeleteOutcome::Forbidden,
            404 => DeleteOutcome::NotFound,
            code => DeleteOutcome::Failed {
                reason: format!(
                    "discord delete failed with status {code}: {}",
                    truncate_for_error(&body, 320)
                ),
            },
        }
    }

    pub async fn post_message(&self, channel: ChannelId, content: &str) -> Result<MessageId> {
        let payload = json!({
            "content": content,
            "allowed_mentions": { "parse": [] },
        });
        let posted: DiscordMessagePayload = self
            .request_json("create message", || {
                self.http
                    .post(format!("{}/channels/{}/messages", self.api_base, channel))
                    .json(&payload)
            })
            .await?;
        Ok(MessageId(parse_snowflake("message.id", &posted.id)?))
    }

    pub async fn get_channel(&self, channel: ChannelId) -> Result<DiscordChannelInfo> {
        let payload: DiscordChannelPayload = self
            .request_json("get channel", || {
                self.http
                    .get(format!("{}/channels/{}", self.api_base, channel))
            })
            .await?;
        let guild_id = payload
            .guild_id
            .as_deref()
            .map(|raw| parse_snowflake("channel.guild_id", raw))
            .transpose()?;
        let overwrites = payload
            .permission_overwrites
            .iter()
            .map(|overwrite| {
                Ok(PermissionOverwrite {
                    id: parse_snowflake("overwrite.id", &overwrite.id)?,
                    kind: if overwrite.kind == 1 {
                        OverwriteKind::Member
                    } else {
                        OverwriteKind::Role
                    },
                    allow: parse_snowflake("overwrite.allow", &overwrite.allow)?,
                    deny: parse_snowflake("overwrite.deny", &overwrite.deny)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DiscordChannelInfo {
            guild_id,
            overwrites,
        })
    }

    pub async fn get_guild(&self, guild_id: u64) -> Result<DiscordGuildInfo> {
        let guild: DiscordGuildPayload = self
            .request_json("get guild", || {
                self.http
                    .get(format!("{}/guilds/{}", self.api_base, guild_id))
            })
            .await?;
        let roles: Vec<DiscordRolePayload> = self
            .request_json("list guild roles", || {
                self.http
                    .get(format!("{}/guilds/{}/roles", self.api_base, guild_id))
            })
            .await?;
        let role_permissions = roles
            .iter()
            .map(|role| {
                Ok((
                    parse_snowflake("role.id", &role.id)?,
                    parse_snowflake("role.permissions", &role.permissions)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DiscordGuildInfo {
            guild_id,
            owner_id: parse_snowflake("guild.owner_id", &guild.owner_id)?,
            role_permissions,
        })
    }

    pub async fn get_member_roles(&self, guild_id: u64, user: UserId) -> Result<Vec<u64>> {
        let member: DiscordMemberPayload = self
            .request_json("get guild member", || {
                self.http.get(format!(
                    "{}/guilds/{}/members/{}",
                    self.api_base, guild_id, user
                ))
            })
            .await?;
        member
            .roles
            .iter()
            .map(|role| parse_snowflake("member.roles", role))
            .collect()
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header("x-sweep-retry-attempt", attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode discord {operation}"))?;
                        return Ok(parsed);
                    }

                    let headers = response.headers().clone();
                    let body = response.text().await.unwrap_or_default();
                    let retry_after = if status.as_u16() == 429 {
                        rate_limit_retry_after(&headers, &body)
                    } else {
                        parse_retry_after(&headers)
                    };
                    if attempt < self.retry_max_attempts
                        && is_retryable_discord_status(status.as_u16())
                    {
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "retrying discord request"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "discord api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("discord api {operation} request failed"));
                }
            }
        }
    }
}

#[async_trait]
impl ChannelLog for DiscordApiClient {
    async fn fetch_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.fetch_history_page(channel, before, limit).await
    }
}

#[async_trait]
impl MessageStore for DiscordApiClient {
    async fn delete(&self, message: &Message) -> DeleteOutcome {
        self.delete_message(message.channel_id, message.id).await
    }
}
