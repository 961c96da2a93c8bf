use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use hostdeck_event_bus::topics;
use hostdeck_logging::LogLevel;
use serde_json::json;
use tokio::time;

use crate::{
    actions::{Action, CompletionMode, OperationError, ResourceType, SyncResult},
    confirmation::{ConfirmationGate, Decision},
    config::ConsoleSettings,
    convergence::{Baseline, ConvergenceProbe},
    hostapi::{HostApi, HostError, SubmitResponse},
    jobs::{Job, JobHandle, JobId, JobRegistry, JobState, Tracking},
    notifications::{NotificationCenter, Severity},
    poller::{PollScheduler, SettlementHandler},
    reconciler::{RefreshOutcome, StateReconciler},
    telemetry::OperationsTelemetry,
};

/// What `submit` hands back.
#[derive(Debug)]
pub enum Submission {
    /// The host finished the action synchronously; snapshots are already reconciled.
    Sync(SyncResult),
    /// The action runs as a tracked job.
    Job(JobHandle),
}

impl Submission {
    /// The job handle, if the action became a job.
    #[must_use]
    pub fn into_job(self) -> Option<JobHandle> {
        match self {
            Self::Job(handle) => Some(handle),
            Self::Sync(_) => None,
        }
    }
}

/// Reconciles, notifies, then stamps `settled_at` on every terminal job.
struct Settlement {
    registry: JobRegistry,
    reconciler: StateReconciler,
    notifications: NotificationCenter,
}

#[async_trait]
impl SettlementHandler for Settlement {
    async fn settle(&self, job: Job) {
        let report = self.reconciler.reconcile(&job.kind, Some(&job.id)).await;
        for (resource_type, err) in &report.failed {
            tracing::warn!(job = %job.id, resource = %resource_type, error = %err, "reconcile fetch failed");
        }
        let (severity, text) = outcome_message(&job);
        self.notifications
            .push_replacing(severity, text, job.action_id);
        self.registry.mark_settled(&job.id);
    }
}

fn outcome_message(job: &Job) -> (Severity, String) {
    let label = job.kind.label();
    match job.state {
        JobState::Completed => (Severity::Success, format!("{label} completed")),
        JobState::Canceled => (Severity::Info, format!("{label} canceled")),
        _ if job.ambiguous => (
            Severity::Warning,
            format!("{label}: outcome unknown, refresh manually"),
        ),
        _ => (
            Severity::Error,
            format!(
                "{label} failed: {}",
                job.error.as_deref().unwrap_or("no message from host")
            ),
        ),
    }
}

/// Builder used to configure an [`ActionDispatcher`].
pub struct ActionDispatcherBuilder {
    host: Arc<dyn HostApi>,
    settings: ConsoleSettings,
    telemetry: Option<OperationsTelemetry>,
}

impl ActionDispatcherBuilder {
    /// Overrides the settings.
    #[must_use]
    pub fn settings(mut self, settings: ConsoleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: OperationsTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Finalizes the builder returning an [`ActionDispatcher`].
    #[must_use]
    pub fn build(self) -> ActionDispatcher {
        let telemetry = self.telemetry.unwrap_or_default();
        let settings = self.settings;
        let registry = JobRegistry::new(settings.registry.terminal_grace());
        let reconciler = StateReconciler::new(
            Arc::clone(&self.host),
            settings.polling.fetch_timeout(),
            telemetry.clone(),
        );
        let notifications = NotificationCenter::new(settings.notifications.ttl(), telemetry.clone());
        let gate = ConfirmationGate::new(telemetry.clone());
        let settlement = Arc::new(Settlement {
            registry: registry.clone(),
            reconciler: reconciler.clone(),
            notifications: notifications.clone(),
        });
        let scheduler = PollScheduler::new(
            Arc::clone(&self.host),
            registry.clone(),
            settings.polling.clone(),
            settings.convergence.clone(),
            settlement,
            telemetry.clone(),
        );
        ActionDispatcher {
            host: self.host,
            settings,
            registry,
            scheduler,
            reconciler,
            gate,
            notifications,
            telemetry,
        }
    }
}

/// Turns operator intents into host requests and tracks them to an outcome.
pub struct ActionDispatcher {
    host: Arc<dyn HostApi>,
    settings: ConsoleSettings,
    registry: JobRegistry,
    scheduler: PollScheduler,
    reconciler: StateReconciler,
    gate: ConfirmationGate,
    notifications: NotificationCenter,
    telemetry: OperationsTelemetry,
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl ActionDispatcher {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn builder(host: Arc<dyn HostApi>) -> ActionDispatcherBuilder {
        ActionDispatcherBuilder {
            host,
            settings: ConsoleSettings::default(),
            telemetry: None,
        }
    }

    /// Submits an action.
    ///
    /// Destructive actions wait at the confirmation gate first. The mutating
    /// request is sent exactly once and never retried.
    pub async fn submit(&self, action: Action) -> Result<Submission, OperationError> {
        if let Err(err) = action.validate() {
            self.failed(&action, &err);
            return Err(err);
        }
        self.telemetry.record(
            LogLevel::Info,
            topics::ACTION_ACCEPTED,
            None,
            json!({
                "action_id": action.id,
                "kind": action.kind.label(),
                "destructive": action.destructive,
                "requester": action.requester,
            }),
        );

        if action.destructive {
            let ticket = self.gate.request(&action).inspect_err(|err| self.failed(&action, err))?;
            if ticket.decision().await == Decision::Rejected {
                let err = OperationError::ConfirmationRejected;
                self.failed(&action, &err);
                return Err(err);
            }
        }

        let convergence = match action.kind.completion_mode() {
            CompletionMode::Convergence(resource_type) => Some(
                self.capture_baseline(resource_type)
                    .await
                    .inspect_err(|err| self.failed(&action, err))?,
            ),
            CompletionMode::HostJob => None,
        };

        let wait = self.settings.polling.fetch_timeout();
        let response = time::timeout(wait, self.host.submit_action(&action))
            .await
            .unwrap_or(Err(HostError::Timeout(wait)))
            .map_err(OperationError::from)
            .inspect_err(|err| self.failed(&action, err))?;

        let routed = match (response, convergence) {
            (SubmitResponse::Job { job_id }, _) => self.track(&action, job_id, Tracking::HostJob, None),
            (SubmitResponse::Immediate { .. }, Some(converge)) => {
                self.track(&action, JobId::local(), Tracking::Convergence, Some(converge))
            }
            (SubmitResponse::Immediate { payload }, None) => {
                let result = SyncResult {
                    action_id: action.id,
                    kind: action.kind.clone(),
                    payload,
                    received_at: Utc::now(),
                };
                self.telemetry.record(
                    LogLevel::Info,
                    topics::ACTION_COMPLETED,
                    None,
                    json!({ "action_id": action.id, "kind": action.kind.label() }),
                );
                self.reconciler.reconcile(&action.kind, None).await;
                self.notifications.push_replacing(
                    Severity::Success,
                    format!("{} completed", action.kind),
                    action.id,
                );
                Ok(Submission::Sync(result))
            }
        };
        routed.inspect_err(|err| self.failed(&action, err))
    }

    /// Cancels a job locally and asks the host to stop it.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, OperationError> {
        self.scheduler.cancel(id).await
    }

    /// Re-fetches one snapshot. Independent of every job.
    pub async fn refresh(&self, resource_type: ResourceType) -> Result<RefreshOutcome, OperationError> {
        self.reconciler.refresh(resource_type).await
    }

    /// Stops every poll loop.
    pub fn shutdown(&self) -> usize {
        self.scheduler.shutdown()
    }

    /// Job registry.
    #[must_use]
    pub const fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Poll scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Snapshot owner.
    #[must_use]
    pub const fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    /// Confirmation gate.
    #[must_use]
    pub const fn gate(&self) -> &ConfirmationGate {
        &self.gate
    }

    /// Notification feed.
    #[must_use]
    pub const fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    async fn capture_baseline(
        &self,
        resource_type: ResourceType,
    ) -> Result<(ConvergenceProbe, Baseline), OperationError> {
        let probe = ConvergenceProbe::new(resource_type, &self.settings.convergence);
        let wait = self.settings.polling.fetch_timeout();
        let payload = time::timeout(wait, self.host.fetch_resource(resource_type, None))
            .await
            .unwrap_or(Err(HostError::Timeout(wait)))?;
        let baseline = probe.baseline(&payload);
        Ok((probe, baseline))
    }

    fn track(
        &self,
        action: &Action,
        job_id: JobId,
        tracking: Tracking,
        convergence: Option<(ConvergenceProbe, Baseline)>,
    ) -> Result<Submission, OperationError> {
        let handle = self
            .registry
            .register(job_id.clone(), action.kind.clone(), action.id, tracking)?;
        match convergence {
            Some((probe, baseline)) => self.scheduler.spawn_convergence(&job_id, probe, baseline)?,
            None => self.scheduler.spawn_job_loop(&job_id)?,
        }
        self.telemetry.record(
            LogLevel::Info,
            topics::JOB_REGISTERED,
            Some(&job_id),
            json!({
                "action_id": action.id,
                "kind": action.kind.label(),
                "tracking": tracking,
            }),
        );
        Ok(Submission::Job(handle))
    }

    fn failed(&self, action: &Action, err: &OperationError) {
        self.telemetry.record(
            LogLevel::Warn,
            topics::ACTION_FAILED,
            None,
            json!({
                "action_id": action.id,
                "kind": action.kind.label(),
                "error": err.to_string(),
                "side_effect_free": err.is_side_effect_free(),
            }),
        );
        if !matches!(err, OperationError::ConfirmationRejected) {
            self.notifications
                .push_replacing(Severity::Error, err.to_string(), action.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{ActionKind, ResourceRef},
        hostapi::{HostCall, JobStatusReport, SimulatedHost},
    };
    use serde_json::json;

    fn dispatcher(host: &SimulatedHost) -> ActionDispatcher {
        ActionDispatcher::builder(Arc::new(host.clone())).build()
    }

    fn restart_nginx() -> Action {
        Action::builder(
            ActionKind::ServiceRestart,
            ResourceRef::member(ResourceType::Services, "nginx"),
        )
        .param("service", "nginx")
        .build()
    }

    #[tokio::test]
    async fn invalid_actions_never_reach_the_host() {
        let host = SimulatedHost::new();
        let dispatcher = dispatcher(&host);
        let action = Action::builder(
            ActionKind::PhpInstall,
            ResourceRef::collection(ResourceType::PhpVersions),
        )
        .param("version", "eight")
        .build();
        let err = dispatcher.submit(action).await.unwrap_err();
        assert!(matches!(err, OperationError::Validation(_)));
        assert_eq!(host.total_calls(), 0);
        assert!(dispatcher.registry().is_empty());
        assert_eq!(dispatcher.notifications().active().len(), 1);
    }

    #[tokio::test]
    async fn immediate_results_are_reconciled_before_returning() {
        let host = SimulatedHost::new();
        host.set_resource(ResourceType::Services, json!({ "nginx": "active" }));
        let dispatcher = dispatcher(&host);

        let submission = dispatcher.submit(restart_nginx()).await.unwrap();
        let Submission::Sync(result) = submission else {
            panic!("expected a synchronous result");
        };
        assert_eq!(result.payload, json!({ "success": true }));
        assert_eq!(host.count(&HostCall::Submit(ActionKind::ServiceRestart)), 1);
        assert_eq!(host.count(&HostCall::Fetch(ResourceType::Services)), 1);
        assert_eq!(
            dispatcher
                .reconciler()
                .snapshot(ResourceType::Services)
                .unwrap()
                .payload,
            json!({ "nginx": "active" })
        );
        let notes = dispatcher.notifications().for_action(result.action_id);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Success);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn submit_failures_are_not_retried() {
        let host = SimulatedHost::new();
        host.respond_to(
            &ActionKind::ServiceRestart,
            Err(HostError::Transport("connection refused".into())),
        );
        let dispatcher = dispatcher(&host);
        let err = dispatcher.submit(restart_nginx()).await.unwrap_err();
        assert!(matches!(err, OperationError::Transport(_)));
        assert_eq!(host.total_calls(), 1);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_surface_the_host_message() {
        let host = SimulatedHost::new();
        let id = JobId::new("bench-7");
        host.respond_to(
            &ActionKind::Benchmark,
            Ok(SubmitResponse::Job { job_id: id.clone() }),
        );
        host.script_job(&id, [Ok(JobStatusReport::failed("fio not installed"))]);
        let dispatcher = dispatcher(&host);
        let action = Action::builder(
            ActionKind::Benchmark,
            ResourceRef::collection(ResourceType::BenchmarkResults),
        )
        .param("type", "disk")
        .build();
        let action_id = action.id;

        let job = dispatcher
            .submit(action)
            .await
            .unwrap()
            .into_job()
            .unwrap()
            .settled()
            .await;
        assert_eq!(job.state, JobState::Failed);
        let notes = dispatcher.notifications().for_action(action_id);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Error);
        assert_eq!(notes[0].text, "system.benchmark failed: fio not installed");
        assert_eq!(host.count(&HostCall::Fetch(ResourceType::BenchmarkResults)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_jobs_are_reconciled_and_reported() {
        let host = SimulatedHost::new();
        let id = JobId::new("apt-1");
        host.respond_to(
            &ActionKind::PackageUpgrade,
            Ok(SubmitResponse::Job { job_id: id.clone() }),
        );
        host.script_job(&id, [Ok(JobStatusReport::running(12.0))]);
        let dispatcher = dispatcher(&host);
        let action = Action::builder(
            ActionKind::PackageUpgrade,
            ResourceRef::collection(ResourceType::PackageList),
        )
        .build();
        let handle = dispatcher.submit(action).await.unwrap().into_job().unwrap();
        time::sleep(std::time::Duration::from_millis(600)).await;

        let job = dispatcher.cancel(&id).await.unwrap();
        assert_eq!(job.state, JobState::Canceled);
        assert!(handle.settled().await.settled_at.is_some());
        assert_eq!(host.count(&HostCall::Cancel(id)), 1);
        assert_eq!(host.count(&HostCall::Fetch(ResourceType::PackageList)), 1);
        assert_eq!(host.count(&HostCall::Fetch(ResourceType::PackageUpdates)), 1);
        assert!(dispatcher.scheduler().active_loops().is_empty());
    }
}
