use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    actions::{ActionId, ActionKind, OperationError},
    hostapi::JobStatusReport,
};

/// Opaque job identifier, either assigned by the host or minted locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps a host supplied id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints an id for an operation the host does not track as a job.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    /// Whether the id was minted locally.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }

    /// Borrowed string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state. `queued -> running -> exactly one terminal state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted by the host, not started.
    Queued,
    /// Executing on the host.
    Running,
    /// Finished successfully.
    Completed,
    /// Canceled locally or by the host.
    Canceled,
    /// Errored on the host, or outcome unknown locally.
    Error,
    /// Failed on the host.
    Failed,
}

impl JobState {
    /// Whether no further transition may occur.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Error | Self::Failed
        )
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            _ => 2,
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }

    /// Parses a host supplied status string.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" | "done" | "success" => Some(Self::Completed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "error" => Some(Self::Error),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How completion of a job is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tracking {
    /// Status is polled from the host by job id.
    HostJob,
    /// Completion is inferred from a reference value changing.
    Convergence,
}

/// Final outcome applied by [`JobRegistry::mark_terminal`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Host reported completion.
    Completed(Option<Value>),
    /// Host reported `failed` with the given message.
    Failed(String),
    /// Host reported `error` with the given message.
    Errored(String),
    /// Canceled locally or by the host.
    Canceled,
    /// Local polling gave up; the host-side operation may still be running.
    Ambiguous {
        /// Consecutive failed status checks.
        attempts: u32,
        /// Last transport error.
        last_error: String,
    },
}

impl JobOutcome {
    /// Terminal state this outcome maps to.
    #[must_use]
    pub const fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
            Self::Errored(_) | Self::Ambiguous { .. } => JobState::Error,
            Self::Canceled => JobState::Canceled,
        }
    }

    /// Derives the outcome carried by a terminal status report.
    #[must_use]
    pub fn from_report(report: &JobStatusReport) -> Option<Self> {
        let message = || {
            report
                .error
                .clone()
                .unwrap_or_else(|| format!("job reported {}", report.state))
        };
        match report.state {
            JobState::Queued | JobState::Running => None,
            JobState::Completed => Some(Self::Completed(report.result.clone())),
            JobState::Failed => Some(Self::Failed(message())),
            JobState::Error => Some(Self::Errored(message())),
            JobState::Canceled => Some(Self::Canceled),
        }
    }
}

/// A tracked long-running host operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Identifier.
    pub id: JobId,
    /// Kind of the action that started the job.
    pub kind: ActionKind,
    /// Action that started the job.
    pub action_id: ActionId,
    /// How completion is observed.
    pub tracking: Tracking,
    /// Registration time.
    pub submitted_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: JobState,
    /// Progress percentage, 0 to 100.
    pub progress: Option<u8>,
    /// Result payload once completed.
    pub result: Option<Value>,
    /// Host or local error message.
    pub error: Option<String>,
    /// Classified failure for failed/error jobs.
    pub failure: Option<OperationError>,
    /// Set when the job was marked `error` because polling gave up.
    pub ambiguous: bool,
    /// Most recent log lines reported by the host.
    pub logs: Vec<String>,
    /// When the terminal state was reached.
    pub terminal_at: Option<DateTime<Utc>>,
    /// When reconciliation and notification for the terminal state finished.
    pub settled_at: Option<DateTime<Utc>>,
}

impl Job {
    fn queued(id: JobId, kind: ActionKind, action_id: ActionId, tracking: Tracking) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            action_id,
            tracking,
            submitted_at: now,
            updated_at: now,
            state: JobState::Queued,
            progress: None,
            result: None,
            error: None,
            failure: None,
            ambiguous: false,
            logs: Vec::new(),
            terminal_at: None,
            settled_at: None,
        }
    }

    /// Whether the job is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn apply_outcome(&mut self, outcome: JobOutcome) {
        let now = Utc::now();
        self.state = outcome.state();
        self.terminal_at = Some(now);
        self.updated_at = now;
        match outcome {
            JobOutcome::Completed(result) => {
                self.progress = Some(100);
                if result.is_some() {
                    self.result = result;
                }
            }
            JobOutcome::Failed(message) | JobOutcome::Errored(message) => {
                self.failure = Some(OperationError::ServerJobFailure {
                    job_id: self.id.clone(),
                    message: message.clone(),
                });
                self.error = Some(message);
            }
            JobOutcome::Canceled => {}
            JobOutcome::Ambiguous {
                attempts,
                last_error,
            } => {
                let failure = OperationError::AmbiguousOutcome {
                    job_id: self.id.clone(),
                    attempts,
                    last_error,
                };
                self.error = Some(failure.to_string());
                self.failure = Some(failure);
                self.ambiguous = true;
            }
        }
    }
}

/// Effect of applying a status report.
#[derive(Debug, Clone)]
pub enum ReportEffect {
    /// Non-terminal update applied (or nothing changed).
    Progress(Job),
    /// The report moved the job to a terminal state.
    Terminal(Job),
    /// The job was already terminal; the report was discarded.
    Discarded,
}

/// Callback invoked with the job after each change.
pub type JobCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// Token returned by [`JobRegistry::subscribe`].
pub type SubscriptionId = u64;

/// Holds every known job and its lifecycle state.
///
/// Each job lives in its own watch channel, so mutations of one job never
/// contend with another beyond the map lookup.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    jobs: RwLock<IndexMap<JobId, Arc<watch::Sender<Job>>>>,
    subscribers: RwLock<HashMap<JobId, Vec<(SubscriptionId, JobCallback)>>>,
    next_subscription: AtomicU64,
    grace: Duration,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.inner.jobs.read().len())
            .field("grace", &self.inner.grace)
            .finish()
    }
}

impl JobRegistry {
    /// Creates a registry retaining terminal jobs for `grace`.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: RwLock::new(IndexMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                grace,
            }),
        }
    }

    /// Registers a new job at `queued`.
    pub fn register(
        &self,
        id: JobId,
        kind: ActionKind,
        action_id: ActionId,
        tracking: Tracking,
    ) -> Result<JobHandle, OperationError> {
        self.purge_expired();
        let mut jobs = self.inner.jobs.write();
        if jobs.contains_key(&id) {
            return Err(OperationError::Infrastructure(format!(
                "job {id} is already registered"
            )));
        }
        let job = Job::queued(id.clone(), kind.clone(), action_id, tracking);
        let (sender, receiver) = watch::channel(job);
        jobs.insert(id.clone(), Arc::new(sender));
        Ok(JobHandle {
            job_id: id,
            action_id,
            kind,
            receiver,
        })
    }

    /// Current view of a job.
    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.purge_expired();
        self.sender(id).map(|sender| sender.borrow().clone())
    }

    /// Jobs still queued or running, in registration order.
    #[must_use]
    pub fn list_active(&self) -> Vec<Job> {
        self.list()
            .into_iter()
            .filter(|job| !job.is_terminal())
            .collect()
    }

    /// Every retained job, in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Job> {
        self.purge_expired();
        self.inner
            .jobs
            .read()
            .values()
            .map(|sender| sender.borrow().clone())
            .collect()
    }

    /// Number of retained jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.inner.jobs.read().len()
    }

    /// Whether no jobs are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver observing every change to a job.
    #[must_use]
    pub fn watch(&self, id: &JobId) -> Option<watch::Receiver<Job>> {
        self.purge_expired();
        self.sender(id).map(|sender| sender.subscribe())
    }

    /// Applies a poll result. Reports landing after a terminal state are discarded.
    pub fn apply_report(
        &self,
        id: &JobId,
        report: &JobStatusReport,
    ) -> Result<ReportEffect, OperationError> {
        if let Some(outcome) = JobOutcome::from_report(report) {
            return Ok(self
                .finish(id, outcome, &report.logs)?
                .map_or(ReportEffect::Discarded, ReportEffect::Terminal));
        }

        let progress = report.progress.map(clamp_progress);
        let applied = self.update_running(id, |job| {
            let mut changed = false;
            if report.state.rank() > job.state.rank() {
                job.state = report.state;
                changed = true;
            }
            if progress.is_some() && progress != job.progress {
                job.progress = progress;
                changed = true;
            }
            if !report.logs.is_empty() && report.logs != job.logs {
                job.logs.clone_from(&report.logs);
                changed = true;
            }
            changed
        })?;
        Ok(applied.map_or(ReportEffect::Discarded, ReportEffect::Progress))
    }

    /// Moves a job to a terminal state.
    ///
    /// Returns `Ok(None)` when the job was already terminal.
    pub fn mark_terminal(
        &self,
        id: &JobId,
        outcome: JobOutcome,
    ) -> Result<Option<Job>, OperationError> {
        self.finish(id, outcome, &[])
    }

    /// Terminal transition carrying the final log lines, published as one change.
    fn finish(
        &self,
        id: &JobId,
        outcome: JobOutcome,
        logs: &[String],
    ) -> Result<Option<Job>, OperationError> {
        let sender = self
            .sender(id)
            .ok_or_else(|| OperationError::UnknownJob(id.clone()))?;
        let mut outcome = Some(outcome);
        let applied = sender.send_if_modified(|job| {
            if job.is_terminal() {
                return false;
            }
            if !logs.is_empty() {
                job.logs = logs.to_vec();
            }
            if let Some(outcome) = outcome.take() {
                job.apply_outcome(outcome);
            }
            true
        });
        if !applied {
            return Ok(None);
        }
        let job = sender.borrow().clone();
        self.notify(&job);
        Ok(Some(job))
    }

    /// Stamps `settled_at` once reconciliation for a terminal job finished.
    pub fn mark_settled(&self, id: &JobId) -> Option<Job> {
        let sender = self.sender(id)?;
        let applied = sender.send_if_modified(|job| {
            if !job.is_terminal() || job.settled_at.is_some() {
                return false;
            }
            job.settled_at = Some(Utc::now());
            true
        });
        let job = sender.borrow().clone();
        if applied {
            self.notify(&job);
        }
        Some(job)
    }

    /// Registers a callback invoked after each change to `id`.
    pub fn subscribe(&self, id: &JobId, callback: JobCallback) -> SubscriptionId {
        let token = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(id.clone())
            .or_default()
            .push((token, callback));
        token
    }

    /// Removes a callback. Returns whether it existed.
    pub fn unsubscribe(&self, token: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let mut removed = false;
        subscribers.retain(|_, callbacks| {
            let before = callbacks.len();
            callbacks.retain(|(existing, _)| *existing != token);
            removed |= callbacks.len() != before;
            !callbacks.is_empty()
        });
        removed
    }

    /// Evicts terminal jobs whose grace window elapsed before `now`.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let grace = self.inner.grace;
        let expired: Vec<JobId> = self
            .inner
            .jobs
            .read()
            .iter()
            .filter(|(_, sender)| {
                sender.borrow().terminal_at.is_some_and(|terminal_at| {
                    now.signed_duration_since(terminal_at)
                        .to_std()
                        .is_ok_and(|elapsed| elapsed >= grace)
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        {
            let mut jobs = self.inner.jobs.write();
            for id in &expired {
                jobs.shift_remove(id);
            }
        }
        let mut subscribers = self.inner.subscribers.write();
        for id in &expired {
            subscribers.remove(id);
        }
        expired.len()
    }

    /// Evicts terminal jobs whose grace window elapsed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn sender(&self, id: &JobId) -> Option<Arc<watch::Sender<Job>>> {
        self.inner.jobs.read().get(id).cloned()
    }

    fn update_running(
        &self,
        id: &JobId,
        update: impl FnOnce(&mut Job) -> bool,
    ) -> Result<Option<Job>, OperationError> {
        let sender = self
            .sender(id)
            .ok_or_else(|| OperationError::UnknownJob(id.clone()))?;
        let mut terminal = false;
        let changed = sender.send_if_modified(|job| {
            if job.is_terminal() {
                terminal = true;
                return false;
            }
            let changed = update(job);
            if changed {
                job.updated_at = Utc::now();
            }
            changed
        });
        if terminal {
            return Ok(None);
        }
        let job = sender.borrow().clone();
        if changed {
            self.notify(&job);
        }
        Ok(Some(job))
    }

    fn notify(&self, job: &Job) {
        let callbacks: Vec<JobCallback> = self
            .inner
            .subscribers
            .read()
            .get(&job.id)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(job);
        }
    }
}

fn clamp_progress(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    // Bounded to 0..=100 before the cast.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let pct = raw.clamp(0.0, 100.0).round() as u8;
    pct
}

/// Handle returned for a registered job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    action_id: ActionId,
    kind: ActionKind,
    receiver: watch::Receiver<Job>,
}

impl JobHandle {
    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> &JobId {
        &self.job_id
    }

    /// Action that started the job.
    #[must_use]
    pub const fn action_id(&self) -> ActionId {
        self.action_id
    }

    /// Kind of that action.
    #[must_use]
    pub const fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Latest observed view of the job.
    #[must_use]
    pub fn current(&self) -> Job {
        self.receiver.borrow().clone()
    }

    /// Waits until the job reaches a terminal state.
    pub async fn outcome(mut self) -> Job {
        self.wait_until(Job::is_terminal).await
    }

    /// Waits until the terminal state was reconciled and notified.
    pub async fn settled(mut self) -> Job {
        self.wait_until(|job| job.settled_at.is_some()).await
    }

    async fn wait_until(&mut self, predicate: impl FnMut(&Job) -> bool) -> Job {
        let reached = self
            .receiver
            .wait_for(predicate)
            .await
            .map(|job| Job::clone(&job))
            .ok();
        // Evicted before the predicate held: report the last value seen.
        reached.unwrap_or_else(|| self.receiver.borrow().clone())
    }
}
