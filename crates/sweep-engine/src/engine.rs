//! The deletion engine: pages backward through a channel, deletes the target
//! author's messages with pacing, checkpoints progress, and honors
//! cooperative cancellation.
//!
//! Cancellation is observed before every page fetch and before every message,
//! never in the middle of a delete call or its pacing sleep. A requested
//! cancel therefore stops the run after at most one in-flight delete plus its
//! pacing delay.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::{sync::watch, time::Instant};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    events::{EventSink, RunEvent},
    model::{current_unix_timestamp_ms, ChannelId, Message, MessageId, UserId},
    registry::{RunCounters, RunHandle, RunStatus},
    source::{ChannelLog, DeleteOutcome, MessageStore},
};

pub const DEFAULT_PAGE_SIZE: usize = 1_000;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1_000;
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Tuning knobs for a run.
pub struct EngineConfig {
    /// Maximum messages requested per page.
    pub page_size: usize,
    /// Save a checkpoint and emit progress every this many examined messages.
    pub checkpoint_interval: u64,
    /// Sleep after each successful delete.
    pub pacing_delay: Duration,
    /// Sleep after a rate-limit response that carried no retry hint.
    pub rate_limit_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            pacing_delay: DEFAULT_PACING_DELAY,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
        }
    }
}

impl EngineConfig {
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.max(1);
        self.checkpoint_interval = self.checkpoint_interval.max(1);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Failures that end a run early.
pub enum EngineError {
    #[error("failed to fetch page for channel {channel_id} before {before:?}: {reason}")]
    PageFetch {
        channel_id: ChannelId,
        before: Option<MessageId>,
        reason: String,
    },
    #[error(
        "channel {channel_id} returned a page ending at {oldest} which does not precede cursor {cursor}"
    )]
    CursorNotAdvancing {
        channel_id: ChannelId,
        cursor: MessageId,
        oldest: MessageId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// How a run reached `Completed`.
pub enum RunOutcome {
    Exhausted,
    Cancelled,
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Final accounting for one run.
pub struct RunSummary {
    pub run_id: String,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub outcome: RunOutcome,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub final_cursor: Option<MessageId>,
    pub started_unix_ms: u64,
    pub completed_unix_ms: u64,
    pub elapsed: Duration,
}

/// Drives runs against injected collaborators. One engine can serve any
/// number of concurrent runs on different channels.
#[derive(Clone)]
pub struct DeletionEngine {
    config: EngineConfig,
    log: Arc<dyn ChannelLog>,
    store: Arc<dyn MessageStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
}

struct PageProgress {
    cursor: Option<MessageId>,
    last_checkpoint: Option<MessageId>,
    last_examined: Option<MessageId>,
}

impl DeletionEngine {
    pub fn new(
        config: EngineConfig,
        log: Arc<dyn ChannelLog>,
        store: Arc<dyn MessageStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config: config.normalized(),
            log,
            store,
            checkpoints,
            events,
        }
    }

    /// Executes one run to completion. The summary event is emitted and the
    /// registry slot released on every path, including a failed page fetch,
    /// which is then returned as the error.
    pub async fn run(
        &self,
        handle: RunHandle,
        start_cursor: Option<MessageId>,
    ) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        handle.set_status(RunStatus::Running);

        let (cursor, resumed_from_checkpoint) = self.initial_cursor(&handle, start_cursor).await;
        handle.set_cursor(cursor);
        self.events.emit(&RunEvent::Started {
            run_id: handle.run_id().to_string(),
            channel_id: handle.channel_id(),
            author_id: handle.author_id(),
            cursor,
            resumed_from_checkpoint,
        });

        let mut progress = PageProgress {
            cursor,
            last_checkpoint: None,
            last_examined: None,
        };
        let cancel_rx = handle.cancel_receiver();
        let result = self.drive(&handle, &cancel_rx, &mut progress).await;
        self.finalize(handle, started, progress, result).await
    }

    async fn initial_cursor(
        &self,
        handle: &RunHandle,
        start_cursor: Option<MessageId>,
    ) -> (Option<MessageId>, bool) {
        if start_cursor.is_some() {
            return (start_cursor, false);
        }
        match self.checkpoints.load(handle.channel_id()).await {
            Ok(Some(checkpoint)) if checkpoint.author_id == handle.author_id() => {
                (Some(checkpoint.message_id), true)
            }
            Ok(Some(checkpoint)) => {
                tracing::debug!(
                    channel_id = %handle.channel_id(),
                    checkpoint_author = %checkpoint.author_id,
                    run_author = %handle.author_id(),
                    "ignoring checkpoint recorded for a different author"
                );
                (None, false)
            }
            Ok(None) => (None, false),
            Err(error) => {
                self.events.emit(&RunEvent::CheckpointFailed {
                    run_id: handle.run_id().to_string(),
                    channel_id: handle.channel_id(),
                    error: error.to_string(),
                });
                (None, false)
            }
        }
    }

    async fn drive(
        &self,
        handle: &RunHandle,
        cancel_rx: &watch::Receiver<bool>,
        progress: &mut PageProgress,
    ) -> Result<RunOutcome, EngineError> {
        let channel_id = handle.channel_id();
        loop {
            if *cancel_rx.borrow() {
                return Ok(self.observe_cancel(handle, progress).await);
            }

            let before = progress.cursor;
            let page = self
                .log
                .fetch_page(channel_id, before, self.config.page_size)
                .await
                .map_err(|error| EngineError::PageFetch {
                    channel_id,
                    before,
                    reason: format!("{error:#}"),
                })?;
            self.events.emit(&RunEvent::PageFetched {
                run_id: handle.run_id().to_string(),
                channel_id,
                before,
                messages: page.len(),
            });

            let Some(oldest) = page.iter().map(|message| message.id).min() else {
                return Ok(RunOutcome::Exhausted);
            };
            if let Some(cursor) = before {
                if oldest >= cursor {
                    return Err(EngineError::CursorNotAdvancing {
                        channel_id,
                        cursor,
                        oldest,
                    });
                }
            }

            for message in &page {
                if *cancel_rx.borrow() {
                    return Ok(self.observe_cancel(handle, progress).await);
                }

                progress.last_examined = Some(message.id);
                let counters = handle.update_counters(|counters| counters.examined += 1);
                if counters.examined % self.config.checkpoint_interval == 0 {
                    self.save_checkpoint(handle, message.id, progress).await;
                    self.events.emit(&RunEvent::Progress {
                        run_id: handle.run_id().to_string(),
                        channel_id,
                        message_id: message.id,
                        examined: counters.examined,
                        deleted: counters.deleted,
                    });
                }

                if message.author_id == handle.author_id() {
                    self.delete_message(handle, message).await;
                }
            }

            progress.cursor = Some(oldest);
            handle.set_cursor(progress.cursor);
            self.save_checkpoint(handle, oldest, progress).await;
        }
    }

    async fn delete_message(&self, handle: &RunHandle, message: &Message) {
        let run_id = handle.run_id().to_string();
        let channel_id = handle.channel_id();
        match self.store.delete(message).await {
            DeleteOutcome::Deleted => {
                handle.update_counters(|counters| counters.deleted += 1);
                self.events.emit(&RunEvent::Deleted {
                    run_id,
                    channel_id,
                    message_id: message.id,
                    author_id: message.author_id,
                });
                tokio::time::sleep(self.config.pacing_delay).await;
            }
            DeleteOutcome::RateLimited { retry_after } => {
                let delay = retry_after.unwrap_or(self.config.rate_limit_backoff);
                handle.update_counters(|counters| counters.rate_limited += 1);
                self.events.emit(&RunEvent::RateLimited {
                    run_id,
                    channel_id,
                    message_id: message.id,
                    retry_after_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
            }
            DeleteOutcome::NotFound => {
                handle.update_counters(|counters| counters.skipped += 1);
                self.events.emit(&RunEvent::DeleteSkipped {
                    run_id,
                    channel_id,
                    message_id: message.id,
                    reason_code: "not_found".to_string(),
                    detail: None,
                });
            }
            DeleteOutcome::Forbidden => {
                handle.update_counters(|counters| counters.failed += 1);
                self.events.emit(&RunEvent::DeleteSkipped {
                    run_id,
                    channel_id,
                    message_id: message.id,
                    reason_code: "forbidden".to_string(),
                    detail: None,
                });
            }
            DeleteOutcome::Failed { reason } => {
                handle.update_counters(|counters| counters.failed += 1);
                self.events.emit(&RunEvent::DeleteSkipped {
                    run_id,
                    channel_id,
                    message_id: message.id,
                    reason_code: "failed".to_string(),
                    detail: Some(reason),
                });
            }
        }
    }

    async fn observe_cancel(&self, handle: &RunHandle, progress: &mut PageProgress) -> RunOutcome {
        handle.set_status(RunStatus::Cancelling);
        let counters = handle.counters();
        self.events.emit(&RunEvent::CancelObserved {
            run_id: handle.run_id().to_string(),
            channel_id: handle.channel_id(),
            examined: counters.examined,
            deleted: counters.deleted,
        });
        if let Some(last_examined) = progress.last_examined {
            self.save_checkpoint(handle, last_examined, progress).await;
        }
        RunOutcome::Cancelled
    }

    /// Persists `message_id` unless an equal or older position was already
    /// saved during this run. Failures are reported and never end the run.
    async fn save_checkpoint(
        &self,
        handle: &RunHandle,
        message_id: MessageId,
        progress: &mut PageProgress,
    ) {
        if progress
            .last_checkpoint
            .is_some_and(|previous| message_id >= previous)
        {
            return;
        }
        let counters = handle.counters();
        let checkpoint = Checkpoint::new(
            handle.channel_id(),
            message_id,
            handle.author_id(),
            counters.examined,
            counters.deleted,
        );
        match self.checkpoints.save(checkpoint).await {
            Ok(()) => {
                progress.last_checkpoint = Some(message_id);
                self.events.emit(&RunEvent::CheckpointSaved {
                    run_id: handle.run_id().to_string(),
                    channel_id: handle.channel_id(),
                    message_id,
                });
            }
            Err(error) => self.events.emit(&RunEvent::CheckpointFailed {
                run_id: handle.run_id().to_string(),
                channel_id: handle.channel_id(),
                error: error.to_string(),
            }),
        }
    }

    async fn finalize(
        &self,
        handle: RunHandle,
        started: Instant,
        progress: PageProgress,
        result: Result<RunOutcome, EngineError>,
    ) -> Result<RunSummary, EngineError> {
        let (outcome, error) = match &result {
            Ok(outcome) => (*outcome, None),
            Err(error) => (RunOutcome::Failed, Some(error.to_string())),
        };

        if outcome == RunOutcome::Exhausted {
            if let Err(error) = self.checkpoints.clear(handle.channel_id()).await {
                self.events.emit(&RunEvent::CheckpointFailed {
                    run_id: handle.run_id().to_string(),
                    channel_id: handle.channel_id(),
                    error: error.to_string(),
                });
            }
        }

        handle.set_status(RunStatus::Completed);
        let elapsed = started.elapsed();
        let counters = handle.counters();
        let summary = RunSummary {
            run_id: handle.run_id().to_string(),
            channel_id: handle.channel_id(),
            author_id: handle.author_id(),
            outcome,
            status: RunStatus::Completed,
            counters,
            final_cursor: progress.cursor,
            started_unix_ms: handle.started_unix_ms(),
            completed_unix_ms: current_unix_timestamp_ms(),
            elapsed,
        };
        self.events.emit(&RunEvent::Summary {
            run_id: summary.run_id.clone(),
            channel_id: summary.channel_id,
            author_id: summary.author_id,
            outcome: outcome.as_str().to_string(),
            examined: counters.examined,
            deleted: counters.deleted,
            skipped: counters.skipped,
            failed: counters.failed,
            rate_limited: counters.rate_limited,
            started_unix_ms: summary.started_unix_ms,
            completed_unix_ms: summary.completed_unix_ms,
            elapsed_ms: elapsed.as_millis() as u64,
            error,
        });
        handle.finish();

        result.map(|_| summary)
    }
}
