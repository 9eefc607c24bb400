//! Discord gateway frame decoding and outbound payloads.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use sweep_engine::{ChannelId, Message, MessageId, UserId};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::discord_transport_helpers::parse_snowflake;

pub(super) const GATEWAY_OP_DISPATCH: u8 = 0;
pub(super) const GATEWAY_OP_HEARTBEAT: u8 = 1;
pub(super) const GATEWAY_OP_IDENTIFY: u8 = 2;
pub(super) const GATEWAY_OP_RECONNECT: u8 = 7;
pub(super) const GATEWAY_OP_INVALID_SESSION: u8 = 9;
pub(super) const GATEWAY_OP_HELLO: u8 = 10;
pub(super) const GATEWAY_OP_HEARTBEAT_ACK: u8 = 11;

pub(super) const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
pub(super) const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

const GATEWAY_QUERY: &str = "v=10&encoding=json";

#[derive(Debug, Deserialize)]
struct GatewayFrame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct ReadyUserPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ReadyPayload {
    user: ReadyUserPayload,
}

#[derive(Debug, Deserialize)]
struct MessageAuthorPayload {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct MessageMemberPayload {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MessageCreatePayload {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: MessageAuthorPayload,
    #[serde(default)]
    member: Option<MessageMemberPayload>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A chat message delivered over the gateway.
pub struct InboundMessage {
    pub message: Message,
    pub guild_id: Option<u64>,
    pub author_is_bot: bool,
    /// Role ids from the partial member object, when Discord includes it.
    pub member_roles: Option<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum GatewayEvent {
    Hello { heartbeat_interval: Duration },
    HeartbeatAck,
    HeartbeatRequest,
    Reconnect,
    InvalidSession,
    Ready { bot_user_id: UserId },
    MessageCreate(InboundMessage),
    Dispatch { name: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ParsedGatewayFrame {
    pub sequence: Option<u64>,
    pub event: GatewayEvent,
}

pub(super) fn gateway_connect_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.contains('?') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/?{GATEWAY_QUERY}")
    }
}

pub(super) fn identify_payload(bot_token: &str) -> Value {
    json!({
        "op": GATEWAY_OP_IDENTIFY,
        "d": {
            "token": bot_token.trim(),
            "intents": INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "sweep",
                "device": "sweep",
            }
        }
    })
}

pub(super) fn heartbeat_payload(sequence: Option<u64>) -> Value {
    json!({
        "op": GATEWAY_OP_HEARTBEAT,
        "d": sequence,
    })
}

pub(super) fn parse_gateway_message(message: WsMessage) -> Result<Option<ParsedGatewayFrame>> {
    match message {
        WsMessage::Text(text) => parse_gateway_text(&text).map(Some),
        WsMessage::Binary(bytes) => {
            let text = String::from_utf8(bytes.to_vec())
                .context("invalid utf-8 discord gateway payload")?;
            parse_gateway_text(&text).map(Some)
        }
        WsMessage::Close(_) => Ok(Some(ParsedGatewayFrame {
            sequence: None,
            event: GatewayEvent::Closed,
        })),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
    }
}

pub(super) fn parse_gateway_text(text: &str) -> Result<ParsedGatewayFrame> {
    let frame = serde_json::from_str::<GatewayFrame>(text)
        .context("failed to parse discord gateway frame")?;
    let event = match frame.op {
        GATEWAY_OP_HELLO => {
            let hello = serde_json::from_value::<HelloPayload>(frame.d)
                .context("failed to parse discord hello payload")?;
            GatewayEvent::Hello {
                heartbeat_interval: Duration::from_millis(hello.heartbeat_interval.max(1)),
            }
        }
        GATEWAY_OP_HEARTBEAT_ACK => GatewayEvent::HeartbeatAck,
        GATEWAY_OP_HEARTBEAT => GatewayEvent::HeartbeatRequest,
        GATEWAY_OP_RECONNECT => GatewayEvent::Reconnect,
        GATEWAY_OP_INVALID_SESSION => GatewayEvent::InvalidSession,
        GATEWAY_OP_DISPATCH => parse_dispatch(frame.t.unwrap_or_default(), frame.d)?,
        other => GatewayEvent::Dispatch {
            name: format!("op:{other}"),
        },
    };
    Ok(ParsedGatewayFrame {
        sequence: frame.s,
        event,
    })
}

fn parse_dispatch(name: String, payload: Value) -> Result<GatewayEvent> {
    match name.as_str() {
        "READY" => {
            let ready = serde_json::from_value::<ReadyPayload>(payload)
                .context("failed to parse discord READY payload")?;
            Ok(GatewayEvent::Ready {
                bot_user_id: UserId(parse_snowflake("ready.user.id", &ready.user.id)?),
            })
        }
        "MESSAGE_CREATE" => {
            let created = serde_json::from_value::<MessageCreatePayload>(payload)
                .context("failed to parse discord MESSAGE_CREATE payload")?;
            Ok(GatewayEvent::MessageCreate(created.into_inbound()?))
        }
        _ => Ok(GatewayEvent::Dispatch { name }),
    }
}

impl MessageCreatePayload {
    fn into_inbound(self) -> Result<InboundMessage> {
        let guild_id = self
            .guild_id
            .as_deref()
            .map(|raw| parse_snowflake("message.guild_id", raw))
            .transpose()?;
        let member_roles = self
            .member
            .map(|member| {
                member
                    .roles
                    .iter()
                    .map(|role| parse_snowflake("message.member.roles", role))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        Ok(InboundMessage {
            message: Message {
                id: MessageId(parse_snowflake("message.id", &self.id)?),
                channel_id: ChannelId(parse_snowflake("message.channel_id", &self.channel_id)?),
                author_id: UserId(parse_snowflake("message.author.id", &self.author.id)?),
                content: self.content,
            },
            guild_id,
            author_is_bot: self.author.bot,
            member_roles,
        })
    }
}
