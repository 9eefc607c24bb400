//! Structured run events and the sinks that consume them.

use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{current_unix_timestamp_ms, ChannelId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
/// Progress and diagnostic records emitted by a run.
pub enum RunEvent {
    Started {
        run_id: String,
        channel_id: ChannelId,
        author_id: UserId,
        cursor: Option<MessageId>,
        resumed_from_checkpoint: bool,
    },
    PageFetched {
        run_id: String,
        channel_id: ChannelId,
        before: Option<MessageId>,
        messages: usize,
    },
    Progress {
        run_id: String,
        channel_id: ChannelId,
        message_id: MessageId,
        examined: u64,
        deleted: u64,
    },
    Deleted {
        run_id: String,
        channel_id: ChannelId,
        message_id: MessageId,
        author_id: UserId,
    },
    DeleteSkipped {
        run_id: String,
        channel_id: ChannelId,
        message_id: MessageId,
        reason_code: String,
        detail: Option<String>,
    },
    RateLimited {
        run_id: String,
        channel_id: ChannelId,
        message_id: MessageId,
        retry_after_ms: u64,
    },
    CheckpointSaved {
        run_id: String,
        channel_id: ChannelId,
        message_id: MessageId,
    },
    CheckpointFailed {
        run_id: String,
        channel_id: ChannelId,
        error: String,
    },
    CancelObserved {
        run_id: String,
        channel_id: ChannelId,
        examined: u64,
        deleted: u64,
    },
    Summary {
        run_id: String,
        channel_id: ChannelId,
        author_id: UserId,
        outcome: String,
        examined: u64,
        deleted: u64,
        skipped: u64,
        failed: u64,
        rate_limited: u64,
        started_unix_ms: u64,
        completed_unix_ms: u64,
        elapsed_ms: u64,
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::PageFetched { .. } => "page_fetched",
            Self::Progress { .. } => "progress",
            Self::Deleted { .. } => "deleted",
            Self::DeleteSkipped { .. } => "delete_skipped",
            Self::RateLimited { .. } => "rate_limited",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::CheckpointFailed { .. } => "checkpoint_failed",
            Self::CancelObserved { .. } => "cancel_observed",
            Self::Summary { .. } => "summary",
        }
    }
}

/// Fire-and-forget consumer of run events. Implementations must not block
/// for long and must swallow their own failures.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::Started {
                run_id,
                channel_id,
                author_id,
                cursor,
                resumed_from_checkpoint,
            } => tracing::info!(
                %run_id,
                %channel_id,
                %author_id,
                cursor = ?cursor.map(MessageId::get),
                resumed_from_checkpoint,
                "deletion run started"
            ),
            RunEvent::PageFetched {
                run_id,
                channel_id,
                before,
                messages,
            } => tracing::debug!(
                %run_id,
                %channel_id,
                before = ?before.map(MessageId::get),
                messages,
                "page fetched"
            ),
            RunEvent::Progress {
                run_id,
                channel_id,
                message_id,
                examined,
                deleted,
            } => tracing::info!(
                %run_id,
                %channel_id,
                %message_id,
                examined,
                deleted,
                "viewed message"
            ),
            RunEvent::Deleted {
                run_id,
                channel_id,
                message_id,
                author_id,
            } => tracing::debug!(%run_id, %channel_id, %message_id, %author_id, "deleted message"),
            RunEvent::DeleteSkipped {
                run_id,
                channel_id,
                message_id,
                reason_code,
                detail,
            } => tracing::warn!(
                %run_id,
                %channel_id,
                %message_id,
                %reason_code,
                detail = detail.as_deref().unwrap_or(""),
                "message not deleted"
            ),
            RunEvent::RateLimited {
                run_id,
                channel_id,
                message_id,
                retry_after_ms,
            } => tracing::warn!(
                %run_id,
                %channel_id,
                %message_id,
                retry_after_ms,
                "rate limited, backing off"
            ),
            RunEvent::CheckpointSaved {
                run_id,
                channel_id,
                message_id,
            } => tracing::debug!(%run_id, %channel_id, %message_id, "checkpoint saved"),
            RunEvent::CheckpointFailed {
                run_id,
                channel_id,
                error,
            } => tracing::warn!(%run_id, %channel_id, %error, "checkpoint save failed"),
            RunEvent::CancelObserved {
                run_id,
                channel_id,
                examined,
                deleted,
            } => tracing::info!(%run_id, %channel_id, examined, deleted, "cancellation observed"),
            RunEvent::Summary {
                run_id,
                channel_id,
                author_id,
                outcome,
                examined,
                deleted,
                skipped,
                failed,
                rate_limited,
                elapsed_ms,
                error,
                ..
            } => {
                if let Some(error) = error {
                    tracing::error!(
                        %run_id,
                        %channel_id,
                        %author_id,
                        %outcome,
                        examined,
                        deleted,
                        skipped,
                        failed,
                        rate_limited,
                        elapsed_ms,
                        %error,
                        "deletion run ended abnormally"
                    );
                } else {
                    tracing::info!(
                        %run_id,
                        %channel_id,
                        %author_id,
                        %outcome,
                        examined,
                        deleted,
                        skipped,
                        failed,
                        rate_limited,
                        elapsed_ms,
                        "deletion run finished"
                    );
                }
            }
        }
    }
}

/// Appends one JSON object per event to a file.
#[derive(Clone)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl JsonlEventSink {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn append(&self, value: &Value) -> Result<()> {
        let line = serde_json::to_string(value).context("failed to encode run event")?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("event log mutex is poisoned"))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: &RunEvent) {
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, kind = event.kind(), "failed to encode run event");
                return;
            }
        };
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "timestamp_unix_ms".to_string(),
                json!(current_unix_timestamp_ms()),
            );
        }
        if let Err(error) = self.append(&value) {
            tracing::warn!(error = %format!("{error:#}"), "failed to append run event");
        }
    }
}

/// Sends every event to each wrapped sink in order.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: &RunEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Keeps events in memory; used by tests and by callers that want to read a
/// run's trail back after it finishes.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &RunEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
