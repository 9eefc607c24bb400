//! Per-channel checkpoint persistence used to resume interrupted runs.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::model::{current_unix_timestamp_ms, ChannelId, MessageId, UserId};

const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Result type for checkpoint store operations.
pub type StoreResult<T> = Result<T, CheckpointStoreError>;

/// Errors returned by checkpoint store implementations.
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("failed to {action} checkpoint file {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse checkpoint file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported checkpoint schema: expected {expected}, found {found}")]
    UnsupportedSchema { expected: u32, found: u32 },
    #[error("checkpoint write task failed: {0}")]
    WriteTask(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Last processed position of a run on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    #[serde(default)]
    pub examined: u64,
    #[serde(default)]
    pub deleted: u64,
    #[serde(default)]
    pub updated_unix_ms: u64,
}

impl Checkpoint {
    pub fn new(
        channel_id: ChannelId,
        message_id: MessageId,
        author_id: UserId,
        examined: u64,
        deleted: u64,
    ) -> Self {
        Self {
            channel_id,
            message_id,
            author_id,
            examined,
            deleted,
            updated_unix_ms: current_unix_timestamp_ms(),
        }
    }
}

#[async_trait]
/// Durable checkpoint storage keyed by channel.
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> StoreResult<()>;
    async fn load(&self, channel: ChannelId) -> StoreResult<Option<Checkpoint>>;
    async fn clear(&self, channel: ChannelId) -> StoreResult<bool>;
    async fn list(&self) -> StoreResult<Vec<Checkpoint>>;
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<ChannelId, Checkpoint>>,
    history: Mutex<Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint ever saved, in write order.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn checkpoints(&self) -> MutexGuard<'_, BTreeMap<ChannelId, Checkpoint>> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(checkpoint.clone());
        self.checkpoints().insert(checkpoint.channel_id, checkpoint);
        Ok(())
    }

    async fn load(&self, channel: ChannelId) -> StoreResult<Option<Checkpoint>> {
        Ok(self.checkpoints().get(&channel).cloned())
    }

    async fn clear(&self, channel: ChannelId) -> StoreResult<bool> {
        Ok(self.checkpoints().remove(&channel).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Checkpoint>> {
        Ok(self.checkpoints().values().cloned().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFileState {
    schema_version: u32,
    #[serde(default)]
    checkpoints: BTreeMap<String, CheckpointEntry>,
}

impl Default for CheckpointFileState {
    fn default() -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            checkpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointEntry {
    message_id: MessageId,
    author_id: UserId,
    #[serde(default)]
    examined: u64,
    #[serde(default)]
    deleted: u64,
    #[serde(default)]
    updated_unix_ms: u64,
}

impl CheckpointEntry {
    fn into_checkpoint(self, channel_id: ChannelId) -> Checkpoint {
        Checkpoint {
            channel_id,
            message_id: self.message_id,
            author_id: self.author_id,
            examined: self.examined,
            deleted: self.deleted,
            updated_unix_ms: self.updated_unix_ms,
        }
    }
}

/// JSON file checkpoint store. The whole map is rewritten atomically on every
/// change; entries for different channels never overwrite each other.
///
/// The in-memory map only reflects a change once the file write succeeded.
/// Writes run on the blocking pool and are ordered by `write_lock`; readers
/// never wait on file I/O.
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
    state: Mutex<CheckpointFileState>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileCheckpointStore {
    #[instrument(fields(path = %path.display()))]
    pub fn open(path: PathBuf) -> StoreResult<Self> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| CheckpointStoreError::Io {
                action: "read",
                path: path.clone(),
                source,
            })?;
            serde_json::from_str::<CheckpointFileState>(&raw).map_err(|source| {
                CheckpointStoreError::Parse {
                    path: path.clone(),
                    source,
                }
            })?
        } else {
            CheckpointFileState::default()
        };

        if state.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointStoreError::UnsupportedSchema {
                expected: CHECKPOINT_SCHEMA_VERSION,
                found: state.schema_version,
            });
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, CheckpointFileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to a copy of the state, writes it, and commits the copy
    /// only after the write succeeded. Returns whatever `change` returned.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut CheckpointFileState) -> Option<T>,
    ) -> StoreResult<Option<T>> {
        let _writer = self.write_lock.lock().await;
        let mut next = self.state().clone();
        let Some(changed) = change(&mut next) else {
            return Ok(None);
        };

        let mut payload = serde_json::to_string_pretty(&next)?;
        payload.push('\n');
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_text_atomic(&path, &payload))
            .await?
            .map_err(|(action, source)| CheckpointStoreError::Io {
                action,
                path: self.path.clone(),
                source,
            })?;

        *self.state() = next;
        Ok(Some(changed))
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        let entry = CheckpointEntry {
            message_id: checkpoint.message_id,
            author_id: checkpoint.author_id,
            examined: checkpoint.examined,
            deleted: checkpoint.deleted,
            updated_unix_ms: checkpoint.updated_unix_ms,
        };
        self.update(|state| {
            state
                .checkpoints
                .insert(checkpoint.channel_id.to_string(), entry);
            Some(())
        })
        .await?;
        Ok(())
    }

    async fn load(&self, channel: ChannelId) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .state()
            .checkpoints
            .get(&channel.to_string())
            .cloned()
            .map(|entry| entry.into_checkpoint(channel)))
    }

    async fn clear(&self, channel: ChannelId) -> StoreResult<bool> {
        let removed = self
            .update(|state| state.checkpoints.remove(&channel.to_string()))
            .await?;
        Ok(removed.is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Checkpoint>> {
        Ok(self
            .state()
            .checkpoints
            .iter()
            .filter_map(|(channel, entry)| {
                let channel = channel.parse::<ChannelId>().ok()?;
                Some(entry.clone().into_checkpoint(channel))
            })
            .collect())
    }
}

/// Writes through a temp file + rename so readers never observe partial data.
fn write_text_atomic(
    path: &Path,
    content: &str,
) -> Result<(), (&'static str, std::io::Error)> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir).map_err(|error| ("create directory for", error))?;

    let temp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("checkpoints"),
        std::process::id(),
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content).map_err(|error| ("write", error))?;
    std::fs::rename(&temp_path, path).map_err(|error| ("replace", error))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{
        Checkpoint, CheckpointStore, CheckpointStoreError, InMemoryCheckpointStore,
        JsonFileCheckpointStore,
    };
    use crate::model::{ChannelId, MessageId, UserId};

    fn checkpoint(channel: u64, message: u64) -> Checkpoint {
        Checkpoint::new(ChannelId(channel), MessageId(message), UserId(7), 10, 2)
    }

    #[tokio::test]
    async fn unit_in_memory_store_keeps_latest_per_channel_and_history() {
        let store = InMemoryCheckpointStore::new();
        store.save(checkpoint(1, 50)).await.expect("save");
        store.save(checkpoint(1, 40)).await.expect("save");
        store.save(checkpoint(2, 90)).await.expect("save");

        let loaded = store.load(ChannelId(1)).await.expect("load").expect("some");
        assert_eq!(loaded.message_id, MessageId(40));
        assert_eq!(store.history().len(), 3);
        assert_eq!(store.list().await.expect("list").len(), 2);
        assert!(store.clear(ChannelId(1)).await.expect("clear"));
        assert!(!store.clear(ChannelId(1)).await.expect("clear"));
    }

    #[tokio::test]
    async fn integration_json_store_persists_across_reopen() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("checkpoints.json");
        {
            let store = JsonFileCheckpointStore::open(path.clone()).expect("open");
            store.save(checkpoint(11, 500)).await.expect("save");
            store.save(checkpoint(12, 600)).await.expect("save");
            assert!(store.clear(ChannelId(12)).await.expect("clear"));
        }

        let reopened = JsonFileCheckpointStore::open(path.clone()).expect("reopen");
        let loaded = reopened
            .load(ChannelId(11))
            .await
            .expect("load")
            .expect("checkpoint");
        assert_eq!(loaded.message_id, MessageId(500));
        assert_eq!(loaded.author_id, UserId(7));
        assert_eq!(loaded.examined, 10);
        assert!(reopened.load(ChannelId(12)).await.expect("load").is_none());

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"schema_version\": 1"));
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn regression_failed_json_write_leaves_store_unchanged() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("checkpoints.json");
        let store = JsonFileCheckpointStore::open(path.clone()).expect("open");
        store.save(checkpoint(2, 70)).await.expect("save");

        std::fs::remove_file(&path).expect("remove file");
        std::fs::create_dir(&path).expect("block path with directory");

        let error = store
            .save(checkpoint(1, 42))
            .await
            .expect_err("rename onto directory fails");
        assert!(matches!(error, CheckpointStoreError::Io { .. }));
        assert_eq!(store.load(ChannelId(1)).await.expect("load"), None);

        assert!(store.clear(ChannelId(2)).await.is_err());
        let kept = store.load(ChannelId(2)).await.expect("load").expect("kept");
        assert_eq!(kept.message_id, MessageId(70));
        assert_eq!(store.list().await.expect("list").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn integration_concurrent_channel_saves_are_all_persisted() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("checkpoints.json");
        let store = std::sync::Arc::new(JsonFileCheckpointStore::open(path.clone()).expect("open"));

        let mut tasks = Vec::new();
        for channel in 1..=16_u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.save(checkpoint(channel, channel * 10)).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("save");
        }

        let reopened = JsonFileCheckpointStore::open(path).expect("reopen");
        assert_eq!(reopened.list().await.expect("list").len(), 16);
        let loaded = reopened.load(ChannelId(9)).await.expect("load").expect("some");
        assert_eq!(loaded.message_id, MessageId(90));
    }

    #[test]
    fn regression_json_store_rejects_unknown_schema_version() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("checkpoints.json");
        std::fs::write(&path, r#"{"schema_version": 99, "checkpoints": {}}"#).expect("write");
        let error = JsonFileCheckpointStore::open(path).expect_err("schema mismatch");
        assert!(matches!(
            error,
            CheckpointStoreError::UnsupportedSchema {
                expected: 1,
                found: 99
            }
        ));
    }

    #[test]
    fn regression_json_store_reports_corrupt_file_path() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("checkpoints.json");
        std::fs::write(&path, "{not json").expect("write");
        let error = JsonFileCheckpointStore::open(path.clone()).expect_err("corrupt");
        assert!(error.to_string().contains(&path.display().to_string()));
    }
}
