//! Cancellable, resumable bulk-deletion engine for chat channel history.
//!
//! A run walks one channel's log backward page by page, deletes every message
//! written by a target author, paces deletions against the platform rate
//! limit, and checkpoints progress so a later run can resume. The
//! [`RunRegistry`] guarantees at most one run per channel.

pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod model;
pub mod registry;
pub mod source;

pub use checkpoint::{
    Checkpoint, CheckpointStore, CheckpointStoreError, InMemoryCheckpointStore,
    JsonFileCheckpointStore,
};
pub use engine::{DeletionEngine, EngineConfig, EngineError, RunOutcome, RunSummary};
pub use events::{
    EventSink, FanoutEventSink, JsonlEventSink, MemoryEventSink, RunEvent, TracingEventSink,
};
pub use model::{current_unix_timestamp_ms, ChannelId, Message, MessageId, UserId};
pub use registry::{
    CancelOutcome, RegistryError, RunCounters, RunHandle, RunRegistry, RunSnapshot, RunStatus,
};
pub use source::{ChannelLog, DeleteOutcome, InMemoryChannelLog, MessageStore};
