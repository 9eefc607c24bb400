//! Collaborator contracts for reading a channel log and deleting messages,
//! plus an in-memory log used by tests and local dry runs.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::model::{ChannelId, Message, MessageId};

#[async_trait]
/// Paged, newest-first access to a channel's history.
pub trait ChannelLog: Send + Sync {
    /// Returns at most `limit` messages strictly older than `before`, newest
    /// first. `before = None` starts from the most recent message. An empty
    /// page means the log is exhausted; a short page does not.
    async fn fetch_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a single delete attempt.
pub enum DeleteOutcome {
    Deleted,
    RateLimited { retry_after: Option<Duration> },
    Forbidden,
    NotFound,
    Failed { reason: String },
}

impl DeleteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::RateLimited { .. } => "rate_limited",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Failed { .. } => "failed",
        }
    }
}

#[async_trait]
/// Deletes individual messages. Never retries on its own; the engine owns the
/// rate-limit policy.
pub trait MessageStore: Send + Sync {
    async fn delete(&self, message: &Message) -> DeleteOutcome;
}

#[derive(Debug, Default)]
struct InMemoryLogInner {
    messages: BTreeMap<(ChannelId, MessageId), Message>,
    scripted_deletes: HashMap<MessageId, VecDeque<DeleteOutcome>>,
    scripted_fetch_failures: VecDeque<String>,
    fetch_calls: Vec<(ChannelId, Option<MessageId>, usize)>,
    delete_calls: Vec<MessageId>,
}

/// In-memory channel history implementing both [`ChannelLog`] and
/// [`MessageStore`].
#[derive(Debug, Default)]
pub struct InMemoryChannelLog {
    inner: Mutex<InMemoryLogInner>,
}

impl InMemoryChannelLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let log = Self::new();
        for message in messages {
            log.push(message);
        }
        log
    }

    pub fn push(&self, message: Message) {
        self.lock()
            .messages
            .insert((message.channel_id, message.id), message);
    }

    /// Queues an outcome returned by the next delete of `id` instead of
    /// removing the message.
    pub fn script_delete(&self, id: MessageId, outcome: DeleteOutcome) {
        self.lock()
            .scripted_deletes
            .entry(id)
            .or_default()
            .push_back(outcome);
    }

    /// Makes the next page fetch fail with `reason`.
    pub fn fail_next_fetch(&self, reason: impl Into<String>) {
        self.lock().scripted_fetch_failures.push_back(reason.into());
    }

    pub fn contains(&self, channel: ChannelId, id: MessageId) -> bool {
        self.lock().messages.contains_key(&(channel, id))
    }

    pub fn remaining(&self, channel: ChannelId) -> Vec<MessageId> {
        self.lock()
            .messages
            .keys()
            .filter(|(message_channel, _)| *message_channel == channel)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn fetch_calls(&self) -> Vec<(ChannelId, Option<MessageId>, usize)> {
        self.lock().fetch_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<MessageId> {
        self.lock().delete_calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChannelLog for InMemoryChannelLog {
    async fn fetch_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut inner = self.lock();
        inner.fetch_calls.push((channel, before, limit));
        if let Some(reason) = inner.scripted_fetch_failures.pop_front() {
            bail!("channel log fetch failed: {reason}");
        }
        let upper = before.unwrap_or(MessageId(u64::MAX));
        let page = inner
            .messages
            .range((channel, MessageId(0))..(channel, upper))
            .rev()
            .take(limit)
            .map(|(_, message)| message.clone())
            .collect();
        Ok(page)
    }
}

#[async_trait]
impl MessageStore for InMemoryChannelLog {
    async fn delete(&self, message: &Message) -> DeleteOutcome {
        let mut inner = self.lock();
        inner.delete_calls.push(message.id);
        if let Some(outcome) = inner
            .scripted_deletes
            .get_mut(&message.id)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        match inner.messages.remove(&(message.channel_id, message.id)) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        }
    }
}
