#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Session event bus carrying operation lifecycle events to observers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Well-known topics published by the operations core.
pub mod topics {
    /// An action passed validation and is about to be dispatched.
    pub const ACTION_ACCEPTED: &str = "action.accepted";
    /// A destructive action is waiting for human approval.
    pub const CONFIRMATION_REQUESTED: &str = "confirmation.requested";
    /// The pending confirmation was answered.
    pub const CONFIRMATION_ANSWERED: &str = "confirmation.answered";
    /// A host job was registered.
    pub const JOB_REGISTERED: &str = "job.registered";
    /// A poll reported progress.
    pub const JOB_PROGRESS: &str = "job.progress";
    /// A job reached a terminal state.
    pub const JOB_TERMINAL: &str = "job.terminal";
    /// A snapshot was replaced after a refresh.
    pub const SNAPSHOT_REFRESHED: &str = "snapshot.refreshed";
    /// A refresh result lost the race against a newer one.
    pub const SNAPSHOT_STALE: &str = "snapshot.stale";
    /// A refresh fetch failed; the previous snapshot stays.
    pub const SNAPSHOT_FAILED: &str = "snapshot.failed";
    /// The host answered an action synchronously.
    pub const ACTION_COMPLETED: &str = "action.completed";
    /// Submitting an action failed before any job existed.
    pub const ACTION_FAILED: &str = "action.failed";
    /// A notification entry was appended to the feed.
    pub const NOTIFICATION_POSTED: &str = "notification.posted";
}

/// Event record encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: String,
    /// Component producing the event.
    pub source: String,
    /// Topic, see [`topics`].
    pub topic: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Job the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Creates a record stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            topic: topic.into(),
            timestamp: Utc::now(),
            job_id: None,
            payload,
        }
    }

    /// Associates the record with a job.
    #[must_use]
    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns a receiver observing every event published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>>;
}

/// In-memory broadcast bus with a bounded backlog of recent events.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<EventRecord>,
    backlog: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Appends to the backlog and fans out to live subscribers without awaiting.
    pub fn emit(&self, event: EventRecord) {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        // No live receivers is not an error for a bus.
        let _ = self.sender.send(event);
    }

    /// Snapshot of recent events retained in memory, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events whose topic equals `topic`.
    #[must_use]
    pub fn by_topic(&self, topic: &str) -> Vec<EventRecord> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.topic == topic)
            .cloned()
            .collect()
    }

    /// Maximum number of retained events.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        self.emit(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>> {
        Ok(self.sender.subscribe())
    }
}

/// File-backed publisher producing a durable audit trail of lifecycle events.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Destination file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Publishes every event to all inner publishers, e.g. memory bus plus audit file.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    targets: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target publisher.
    #[must_use]
    pub fn with(mut self, target: Arc<dyn EventPublisher>) -> Self {
        self.targets.push(target);
        self
    }

    /// Number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(err) = target.publish(event.clone()).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
