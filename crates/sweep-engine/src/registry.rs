//! Per-channel run registry: at most one active run per channel, with
//! cooperative cancellation handles.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Instant,
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::model::{current_unix_timestamp_ms, ChannelId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Lifecycle of one run.
pub enum RunStatus {
    Idle,
    Running,
    Cancelling,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Counters maintained by the engine while a run progresses.
pub struct RunCounters {
    pub examined: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Point-in-time view of an active run.
pub struct RunSnapshot {
    pub run_id: String,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub status: RunStatus,
    pub cursor: Option<MessageId>,
    pub counters: RunCounters,
    pub started_unix_ms: u64,
    pub elapsed_ms: u64,
    pub cancel_requested: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a deletion run ({run_id}) is already in progress in channel {channel_id}")]
    AlreadyRunning {
        channel_id: ChannelId,
        run_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of [`RunRegistry::request_cancel`].
pub enum CancelOutcome {
    Requested,
    AlreadyRequested,
    NoActiveRun,
}

#[derive(Debug)]
struct RunState {
    run_id: String,
    channel_id: ChannelId,
    author_id: UserId,
    started_unix_ms: u64,
    started: Instant,
    status: Mutex<RunStatus>,
    cursor: Mutex<Option<MessageId>>,
    counters: Mutex<RunCounters>,
    cancel_tx: watch::Sender<bool>,
}

impl RunState {
    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            channel_id: self.channel_id,
            author_id: self.author_id,
            status: *lock(&self.status),
            cursor: *lock(&self.cursor),
            counters: *lock(&self.counters),
            started_unix_ms: self.started_unix_ms,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            cancel_requested: *self.cancel_tx.borrow(),
        }
    }

    fn request_cancel(&self) -> CancelOutcome {
        let changed = self.cancel_tx.send_if_modified(|requested| {
            if *requested {
                return false;
            }
            *requested = true;
            true
        });
        if changed {
            CancelOutcome::Requested
        } else {
            CancelOutcome::AlreadyRequested
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the channel → active run mapping. Share it as `Arc<RunRegistry>`;
/// the map lock is only held for single map operations.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<ChannelId, Arc<RunState>>>,
    next_run_seq: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically registers a new run for `channel`, or reports the run that
    /// already holds it.
    pub fn try_start(
        self: &Arc<Self>,
        channel_id: ChannelId,
        author_id: UserId,
    ) -> Result<RunHandle, RegistryError> {
        let mut runs = lock(&self.runs);
        if let Some(active) = runs.get(&channel_id) {
            return Err(RegistryError::AlreadyRunning {
                channel_id,
                run_id: active.run_id.clone(),
            });
        }

        let started_unix_ms = current_unix_timestamp_ms();
        let sequence = self.next_run_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, _) = watch::channel(false);
        let state = Arc::new(RunState {
            run_id: format!("sweep-{channel_id}-{started_unix_ms}-{sequence}"),
            channel_id,
            author_id,
            started_unix_ms,
            started: Instant::now(),
            status: Mutex::new(RunStatus::Idle),
            cursor: Mutex::new(None),
            counters: Mutex::new(RunCounters::default()),
            cancel_tx,
        });
        runs.insert(channel_id, Arc::clone(&state));
        drop(runs);

        Ok(RunHandle {
            registry: Arc::clone(self),
            state,
            released: false,
        })
    }

    /// Flags the active run on `channel` for cooperative cancellation.
    pub fn request_cancel(&self, channel_id: ChannelId) -> CancelOutcome {
        let state = lock(&self.runs).get(&channel_id).cloned();
        match state {
            Some(state) => state.request_cancel(),
            None => CancelOutcome::NoActiveRun,
        }
    }

    /// Requests cancellation of every active run; returns how many runs were
    /// newly flagged.
    pub fn cancel_all(&self) -> usize {
        let states = lock(&self.runs).values().cloned().collect::<Vec<_>>();
        states
            .iter()
            .filter(|state| state.request_cancel() == CancelOutcome::Requested)
            .count()
    }

    /// Removes the entry for `channel` if it still belongs to `run_id`.
    pub fn release(&self, channel_id: ChannelId, run_id: &str) -> bool {
        let mut runs = lock(&self.runs);
        match runs.get(&channel_id) {
            Some(active) if active.run_id == run_id => {
                runs.remove(&channel_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, channel_id: ChannelId) -> bool {
        lock(&self.runs).contains_key(&channel_id)
    }

    pub fn snapshot(&self, channel_id: ChannelId) -> Option<RunSnapshot> {
        let state = lock(&self.runs).get(&channel_id).cloned();
        state.map(|state| state.snapshot())
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut channels = lock(&self.runs).keys().copied().collect::<Vec<_>>();
        channels.sort();
        channels
    }
}

/// Exclusive claim on a channel, handed to the engine. Dropping the handle
/// releases the channel if [`RunHandle::finish`] was never reached.
#[derive(Debug)]
pub struct RunHandle {
    registry: Arc<RunRegistry>,
    state: Arc<RunState>,
    released: bool,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.state.channel_id
    }

    pub fn author_id(&self) -> UserId {
        self.state.author_id
    }

    pub fn started_unix_ms(&self) -> u64 {
        self.state.started_unix_ms
    }

    /// Cancellation token for the engine; flips to `true` once requested.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.state.cancel_tx.subscribe()
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.state.cancel_tx.borrow()
    }

    pub fn request_cancel(&self) -> CancelOutcome {
        self.state.request_cancel()
    }

    pub fn set_status(&self, status: RunStatus) {
        *lock(&self.state.status) = status;
    }

    pub fn set_cursor(&self, cursor: Option<MessageId>) {
        *lock(&self.state.cursor) = cursor;
    }

    pub fn counters(&self) -> RunCounters {
        *lock(&self.state.counters)
    }

    pub fn update_counters(&self, update: impl FnOnce(&mut RunCounters)) -> RunCounters {
        let mut counters = lock(&self.state.counters);
        update(&mut counters);
        *counters
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.snapshot()
    }

    /// Marks the run completed and frees the channel slot.
    pub fn finish(mut self) -> RunSnapshot {
        self.set_status(RunStatus::Completed);
        self.release_slot();
        self.state.snapshot()
    }

    fn release_slot(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry
            .release(self.state.channel_id, &self.state.run_id);
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.released {
            self.set_status(RunStatus::Completed);
            self.release_slot();
        }
    }
}
