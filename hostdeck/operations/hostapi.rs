use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    actions::{Action, ActionKind, OperationError, ResourceType},
    jobs::{JobId, JobState},
};

/// Answer to `submit_action`, tagged at the boundary instead of probed at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubmitResponse {
    /// The host finished the action synchronously.
    Immediate {
        /// Result payload.
        payload: Value,
    },
    /// The host accepted the action as a background job.
    Job {
        /// Host job id.
        job_id: JobId,
    },
}

/// Status returned by `job_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    /// Reported state.
    pub state: JobState,
    /// Reported progress percentage.
    #[serde(default)]
    pub progress: Option<f64>,
    /// Result payload, typically on completion.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error message, typically on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Log lines streamed by the job.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl Default for JobStatusReport {
    fn default() -> Self {
        Self {
            state: JobState::Queued,
            progress: None,
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }
}

impl JobStatusReport {
    /// Running report with progress.
    #[must_use]
    pub fn running(progress: f64) -> Self {
        Self {
            state: JobState::Running,
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// Completed report with a result payload.
    #[must_use]
    pub fn completed(result: Value) -> Self {
        Self {
            state: JobState::Completed,
            result: Some(result),
            ..Self::default()
        }
    }

    /// Failed report with a server message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Failures at the host boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// Network failure or 5xx.
    #[error("transport error: {0}")]
    Transport(String),
    /// The call exceeded its bounded wait.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The host refused the request.
    #[error("host rejected request ({status}): {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Host message.
        message: String,
    },
}

impl HostError {
    /// Whether the failure is worth retrying at the poll layer.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
        }
    }
}

impl From<HostError> for OperationError {
    fn from(err: HostError) -> Self {
        if err.is_transient() {
            Self::Transport(err.to_string())
        } else {
            Self::Validation(err.to_string())
        }
    }
}

/// Narrow interface to the backend API. Credentials are the implementor's concern.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Issues the mutating request for an action.
    async fn submit_action(&self, action: &Action) -> Result<SubmitResponse, HostError>;
    /// Fetches the status of a host job.
    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, HostError>;
    /// Asks the host to cancel a job. Best effort.
    async fn cancel_job(&self, job_id: &JobId) -> Result<(), HostError>;
    /// Fetches a resource collection or member.
    async fn fetch_resource(
        &self,
        resource_type: ResourceType,
        identity: Option<&str>,
    ) -> Result<Value, HostError>;
}

/// A call observed by [`SimulatedHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    /// `submit_action` for the given kind.
    Submit(ActionKind),
    /// `job_status` for the given job.
    Status(JobId),
    /// `cancel_job` for the given job.
    Cancel(JobId),
    /// `fetch_resource` for the given type.
    Fetch(ResourceType),
}

#[derive(Default)]
struct SimulatedState {
    submit_responses: HashMap<String, VecDeque<Result<SubmitResponse, HostError>>>,
    status_scripts: HashMap<JobId, VecDeque<Result<JobStatusReport, HostError>>>,
    last_status: HashMap<JobId, Result<JobStatusReport, HostError>>,
    resources: HashMap<ResourceType, VecDeque<Value>>,
    last_resource: HashMap<ResourceType, Value>,
    members: HashMap<(ResourceType, String), Value>,
    calls: Vec<HostCall>,
}

/// Scriptable in-memory host used by tests and the CLI scenarios.
///
/// Scripts are consumed in order; once a script runs dry the last answer repeats.
#[derive(Clone, Default)]
pub struct SimulatedHost {
    state: Arc<Mutex<SimulatedState>>,
    status_latency: Arc<Mutex<Option<Duration>>>,
    fetch_latency: Arc<Mutex<HashMap<ResourceType, Duration>>>,
}

impl SimulatedHost {
    /// Creates a host with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer to the next submission of `kind`.
    pub fn respond_to(&self, kind: &ActionKind, response: Result<SubmitResponse, HostError>) {
        self.state
            .lock()
            .submit_responses
            .entry(kind.label().to_string())
            .or_default()
            .push_back(response);
    }

    /// Queues status answers for `job_id`.
    pub fn script_job(
        &self,
        job_id: &JobId,
        script: impl IntoIterator<Item = Result<JobStatusReport, HostError>>,
    ) {
        self.state
            .lock()
            .status_scripts
            .entry(job_id.clone())
            .or_default()
            .extend(script);
    }

    /// Queues successive payloads for a resource.
    pub fn script_resource(&self, resource_type: ResourceType, payloads: impl IntoIterator<Item = Value>) {
        self.state
            .lock()
            .resources
            .entry(resource_type)
            .or_default()
            .extend(payloads);
    }

    /// Replaces a resource's payload outright.
    pub fn set_resource(&self, resource_type: ResourceType, payload: Value) {
        let mut state = self.state.lock();
        state.resources.remove(&resource_type);
        state.last_resource.insert(resource_type, payload);
    }

    /// Sets the payload answered for one member of a collection.
    pub fn set_member(&self, resource_type: ResourceType, identity: &str, payload: Value) {
        self.state
            .lock()
            .members
            .insert((resource_type, identity.to_string()), payload);
    }

    /// Delays every status answer by `latency`.
    pub fn set_status_latency(&self, latency: Option<Duration>) {
        *self.status_latency.lock() = latency;
    }

    /// Delays fetches of one resource type by `latency`.
    pub fn set_fetch_latency(&self, resource_type: ResourceType, latency: Duration) {
        self.fetch_latency.lock().insert(resource_type, latency);
    }

    /// Every call observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// Number of observed calls matching `call`.
    #[must_use]
    pub fn count(&self, call: &HostCall) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|seen| *seen == call)
            .count()
    }

    /// Total number of observed calls.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn record(&self, call: HostCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl HostApi for SimulatedHost {
    async fn submit_action(&self, action: &Action) -> Result<SubmitResponse, HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::Submit(action.kind.clone()));
        state
            .submit_responses
            .get_mut(action.kind.label())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(SubmitResponse::Immediate {
                    payload: serde_json::json!({ "success": true }),
                })
            })
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, HostError> {
        self.record(HostCall::Status(job_id.clone()));
        let latency = *self.status_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        let next = state
            .status_scripts
            .get_mut(job_id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(answer) => {
                state.last_status.insert(job_id.clone(), answer.clone());
                answer
            }
            None => state.last_status.get(job_id).cloned().unwrap_or_else(|| {
                Err(HostError::Rejected {
                    status: 404,
                    message: format!("job {job_id} not found"),
                })
            }),
        }
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<(), HostError> {
        self.record(HostCall::Cancel(job_id.clone()));
        Ok(())
    }

    async fn fetch_resource(
        &self,
        resource_type: ResourceType,
        identity: Option<&str>,
    ) -> Result<Value, HostError> {
        self.record(HostCall::Fetch(resource_type));
        let latency = self.fetch_latency.lock().get(&resource_type).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        if let Some(identity) = identity {
            let member = state.members.get(&(resource_type, identity.to_string()));
            return member.cloned().ok_or_else(|| HostError::Rejected {
                status: 404,
                message: format!("{resource_type} {identity} not found"),
            });
        }
        let next = state
            .resources
            .get_mut(&resource_type)
            .and_then(VecDeque::pop_front);
        if let Some(payload) = next {
            state.last_resource.insert(resource_type, payload.clone());
            return Ok(payload);
        }
        Ok(state
            .last_resource
            .get(&resource_type)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "items": [] })))
    }
}
