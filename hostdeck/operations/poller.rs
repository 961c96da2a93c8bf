use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use hostdeck_event_bus::topics;
use hostdeck_logging::LogLevel;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    actions::{millis, OperationError},
    config::{ConvergenceSettings, PollingSettings},
    convergence::{Baseline, ConvergenceProbe, ConvergenceVerdict},
    hostapi::{HostApi, HostError, JobStatusReport},
    jobs::{Job, JobId, JobOutcome, JobRegistry, JobState, ReportEffect, Tracking},
    telemetry::OperationsTelemetry,
};

/// Receives every job once it reached a terminal state and its loop is gone.
#[async_trait]
pub trait SettlementHandler: Send + Sync {
    /// Reconciles and reports a terminal job.
    async fn settle(&self, job: Job);
}

struct LoopSlot {
    token: u64,
    stop: watch::Sender<bool>,
}

/// Runs one status loop per non-terminal job.
///
/// Loops tick on a fixed interval, wrap every fetch in a bounded wait and
/// remove themselves from the active set before handing the terminal job to
/// the [`SettlementHandler`].
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    host: Arc<dyn HostApi>,
    registry: JobRegistry,
    polling: PollingSettings,
    convergence: ConvergenceSettings,
    settlement: Arc<dyn SettlementHandler>,
    telemetry: OperationsTelemetry,
    loops: Mutex<HashMap<JobId, LoopSlot>>,
    next_token: AtomicU64,
}

impl fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollScheduler")
            .field("polling", &self.inner.polling)
            .field("active", &self.inner.loops.lock().len())
            .finish_non_exhaustive()
    }
}

impl PollScheduler {
    /// Creates a scheduler polling `host` and writing into `registry`.
    #[must_use]
    pub fn new(
        host: Arc<dyn HostApi>,
        registry: JobRegistry,
        polling: PollingSettings,
        convergence: ConvergenceSettings,
        settlement: Arc<dyn SettlementHandler>,
        telemetry: OperationsTelemetry,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                host,
                registry,
                polling,
                convergence,
                settlement,
                telemetry,
                loops: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Starts polling a host job.
    pub fn spawn_job_loop(&self, id: &JobId) -> Result<(), OperationError> {
        let (token, stop) = self.claim(id)?;
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        tokio::spawn(async move {
            let terminal = inner.run_job_loop(&id, stop).await;
            inner.finish(&id, token, terminal).await;
        });
        Ok(())
    }

    /// Starts probing for convergence away from `baseline`.
    pub fn spawn_convergence(
        &self,
        id: &JobId,
        probe: ConvergenceProbe,
        baseline: Baseline,
    ) -> Result<(), OperationError> {
        let (token, stop) = self.claim(id)?;
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        tokio::spawn(async move {
            let terminal = inner
                .run_convergence_loop(&id, &probe, &baseline, stop)
                .await;
            inner.finish(&id, token, terminal).await;
        });
        Ok(())
    }

    /// Cancels a job.
    ///
    /// The local job turns `canceled` before the host is asked; the host call
    /// is best effort and its failure only gets logged.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, OperationError> {
        let registry = &self.inner.registry;
        let Some(job) = registry.mark_terminal(id, JobOutcome::Canceled)? else {
            let state = registry.get(id).map_or(JobState::Canceled, |job| job.state);
            return Err(OperationError::AlreadyTerminal {
                job_id: id.clone(),
                state,
            });
        };
        self.stop_loop(id);
        self.inner.telemetry.record(
            LogLevel::Info,
            topics::JOB_TERMINAL,
            Some(id),
            json!({ "kind": job.kind.label(), "state": "canceled", "origin": "local" }),
        );

        if job.tracking == Tracking::HostJob {
            let wait = self.inner.polling.fetch_timeout();
            let acknowledged = time::timeout(wait, self.inner.host.cancel_job(id))
                .await
                .unwrap_or(Err(HostError::Timeout(wait)));
            if let Err(err) = acknowledged {
                tracing::warn!(job = %id, error = %err, "host did not acknowledge cancel");
            }
        }

        self.inner.settlement.settle(job.clone()).await;
        Ok(registry.get(id).unwrap_or(job))
    }

    /// Jobs with a live loop.
    #[must_use]
    pub fn active_loops(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.loops.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether `id` has a live loop.
    #[must_use]
    pub fn is_polling(&self, id: &JobId) -> bool {
        self.inner.loops.lock().contains_key(id)
    }

    /// Stops every loop. Jobs keep their last state.
    pub fn shutdown(&self) -> usize {
        let slots: Vec<LoopSlot> = self.inner.loops.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            let _ = slot.stop.send(true);
        }
        slots.len()
    }

    fn claim(&self, id: &JobId) -> Result<(u64, watch::Receiver<bool>), OperationError> {
        let mut loops = self.inner.loops.lock();
        if loops.contains_key(id) {
            return Err(OperationError::Infrastructure(format!(
                "job {id} already has a poll loop"
            )));
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (stop, receiver) = watch::channel(false);
        loops.insert(id.clone(), LoopSlot { token, stop });
        Ok((token, receiver))
    }

    fn stop_loop(&self, id: &JobId) {
        if let Some(slot) = self.inner.loops.lock().remove(id) {
            let _ = slot.stop.send(true);
        }
    }
}

impl SchedulerInner {
    fn ticker(&self) -> time::Interval {
        let period = self.polling.interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn run_job_loop(&self, id: &JobId, mut stop: watch::Receiver<bool>) -> Option<Job> {
        let mut ticker = self.ticker();
        let wait = self.polling.fetch_timeout();
        let mut failures = 0_u32;
        let mut last_seen: Option<(JobState, Option<u8>)> = None;
        loop {
            tokio::select! {
                _ = stop.changed() => return None,
                _ = ticker.tick() => {}
            }
            let fetched = tokio::select! {
                _ = stop.changed() => return None,
                fetched = time::timeout(wait, self.host.job_status(id)) => {
                    fetched.unwrap_or(Err(HostError::Timeout(wait)))
                }
            };
            let report = match fetched {
                Ok(report) => report,
                Err(err) if !err.is_transient() => return self.refused(id, &err),
                Err(err) => {
                    failures += 1;
                    if self.exhausted(id, failures, &err) {
                        return self.give_up(id, failures, &err);
                    }
                    continue;
                }
            };
            failures = 0;
            match self.registry.apply_report(id, &report) {
                Ok(ReportEffect::Progress(job)) => {
                    let seen = Some((job.state, job.progress));
                    if seen != last_seen {
                        last_seen = seen;
                        self.telemetry.record(
                            LogLevel::Debug,
                            topics::JOB_PROGRESS,
                            Some(id),
                            json!({ "state": job.state, "progress": job.progress }),
                        );
                    }
                }
                Ok(ReportEffect::Terminal(job)) => {
                    self.record_terminal(&job);
                    return Some(job);
                }
                Ok(ReportEffect::Discarded) => {
                    tracing::debug!(job = %id, "discarded status for terminal job");
                    return None;
                }
                Err(err) => {
                    tracing::warn!(job = %id, error = %err, "poll loop lost its job");
                    return None;
                }
            }
        }
    }

    async fn run_convergence_loop(
        &self,
        id: &JobId,
        probe: &ConvergenceProbe,
        baseline: &Baseline,
        mut stop: watch::Receiver<bool>,
    ) -> Option<Job> {
        let mut ticker = self.ticker();
        let wait = self.polling.fetch_timeout();
        let deadline = Instant::now() + self.convergence.max_wait();
        let mut failures = 0_u32;
        let mut probes = 0_u32;
        loop {
            tokio::select! {
                _ = stop.changed() => return None,
                _ = ticker.tick() => {}
            }
            if Instant::now() >= deadline {
                let outcome = JobOutcome::Ambiguous {
                    attempts: probes,
                    last_error: format!(
                        "{} did not change within {}s",
                        probe.resource_type, self.convergence.max_wait_secs
                    ),
                };
                return self.terminal(id, outcome);
            }
            let fetched = tokio::select! {
                _ = stop.changed() => return None,
                fetched = time::timeout(wait, self.host.fetch_resource(probe.resource_type, None)) => {
                    fetched.unwrap_or(Err(HostError::Timeout(wait)))
                }
            };
            let payload = match fetched {
                Ok(payload) => payload,
                Err(err) if !err.is_transient() => return self.refused(id, &err),
                Err(err) => {
                    failures += 1;
                    if self.exhausted(id, failures, &err) {
                        return self.give_up(id, failures, &err);
                    }
                    continue;
                }
            };
            failures = 0;
            probes += 1;
            match probe.evaluate(baseline, &payload) {
                ConvergenceVerdict::Pending => {
                    let running = JobStatusReport {
                        state: JobState::Running,
                        ..JobStatusReport::default()
                    };
                    if let Ok(ReportEffect::Discarded) | Err(_) =
                        self.registry.apply_report(id, &running)
                    {
                        return None;
                    }
                    tracing::debug!(job = %id, probes, "reference unchanged");
                }
                ConvergenceVerdict::Converged { reason, reference } => {
                    let result = json!({
                        "reason": reason,
                        "baseline": baseline.reference,
                        "reference": reference,
                        "probes": probes,
                    });
                    return self.terminal(id, JobOutcome::Completed(Some(result)));
                }
            }
        }
    }

    fn exhausted(&self, id: &JobId, failures: u32, err: &HostError) -> bool {
        tracing::warn!(
            job = %id,
            failures,
            limit = self.polling.transport_failure_limit,
            error = %err,
            "status fetch failed"
        );
        failures >= self.polling.transport_failure_limit
    }

    fn give_up(&self, id: &JobId, failures: u32, err: &HostError) -> Option<Job> {
        self.terminal(
            id,
            JobOutcome::Ambiguous {
                attempts: failures,
                last_error: err.to_string(),
            },
        )
    }

    /// A definitive host answer ends the job with the host's message.
    fn refused(&self, id: &JobId, err: &HostError) -> Option<Job> {
        let message = match err {
            HostError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        };
        tracing::warn!(job = %id, error = %err, "host refused status request");
        self.terminal(id, JobOutcome::Errored(message))
    }

    fn terminal(&self, id: &JobId, outcome: JobOutcome) -> Option<Job> {
        match self.registry.mark_terminal(id, outcome) {
            Ok(Some(job)) => {
                self.record_terminal(&job);
                Some(job)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(job = %id, error = %err, "poll loop lost its job");
                None
            }
        }
    }

    fn record_terminal(&self, job: &Job) {
        let level = match job.state {
            JobState::Completed | JobState::Canceled => LogLevel::Info,
            _ if job.ambiguous => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        let elapsed = job
            .terminal_at
            .and_then(|at| at.signed_duration_since(job.submitted_at).to_std().ok())
            .map(millis);
        self.telemetry.record(
            level,
            topics::JOB_TERMINAL,
            Some(&job.id),
            json!({
                "kind": job.kind.label(),
                "state": job.state,
                "ambiguous": job.ambiguous,
                "error": job.error,
                "elapsed_ms": elapsed,
            }),
        );
    }

    async fn finish(&self, id: &JobId, token: u64, terminal: Option<Job>) {
        {
            let mut loops = self.loops.lock();
            if loops.get(id).is_some_and(|slot| slot.token == token) {
                loops.remove(id);
            }
        }
        if let Some(job) = terminal {
            self.settlement.settle(job).await;
        }
    }
}

/// Payload attached to convergence results, for callers that only want the reference.
#[must_use]
pub fn converged_reference(job: &Job) -> Option<&Value> {
    job.result
        .as_ref()
        .and_then(|result| result.get("reference"))
        .filter(|value| !value.is_null())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        actions::{ActionId, ActionKind, ResourceType},
        hostapi::{HostCall, SimulatedHost},
        jobs::JobHandle,
    };

    struct Recorder {
        registry: JobRegistry,
        settled: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl SettlementHandler for Recorder {
        async fn settle(&self, job: Job) {
            self.registry.mark_settled(&job.id);
            self.settled.lock().push(job);
        }
    }

    struct Fixture {
        host: SimulatedHost,
        registry: JobRegistry,
        recorder: Arc<Recorder>,
        scheduler: PollScheduler,
    }

    fn fixture(convergence: ConvergenceSettings) -> Fixture {
        let host = SimulatedHost::new();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let recorder = Arc::new(Recorder {
            registry: registry.clone(),
            settled: Mutex::new(Vec::new()),
        });
        let scheduler = PollScheduler::new(
            Arc::new(host.clone()),
            registry.clone(),
            PollingSettings::default(),
            convergence,
            recorder.clone(),
            OperationsTelemetry::disabled(),
        );
        Fixture {
            host,
            registry,
            recorder,
            scheduler,
        }
    }

    fn register(fx: &Fixture, id: &str, tracking: Tracking) -> JobHandle {
        fx.registry
            .register(
                JobId::new(id),
                ActionKind::PhpInstall,
                ActionId::new_v4(),
                tracking,
            )
            .unwrap()
    }

    fn transport(message: &str) -> Result<JobStatusReport, HostError> {
        Err(HostError::Transport(message.into()))
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_to_completion_and_releases_its_slot() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("j1");
        fx.host.script_job(
            &id,
            [
                Ok(JobStatusReport::running(40.0)),
                Ok(JobStatusReport::completed(json!({ "success": true }))),
            ],
        );
        let handle = register(&fx, "j1", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();
        assert!(fx.scheduler.is_polling(&id));

        let job = handle.settled().await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, Some(100));
        assert!(fx.scheduler.active_loops().is_empty());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.host.count(&HostCall::Status(id)), 2);
        assert_eq!(fx.recorder.settled.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_transport_failures_end_ambiguous() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("j2");
        fx.host.script_job(&id, [transport("connection reset")]);
        let handle = register(&fx, "j2", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();

        let job = handle.settled().await;
        assert_eq!(job.state, JobState::Error);
        assert!(job.ambiguous);
        assert!(matches!(
            job.failure,
            Some(OperationError::AmbiguousOutcome { attempts: 5, .. })
        ));
        assert_eq!(fx.host.count(&HostCall::Status(id)), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_refusals_end_the_job_without_retrying() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("gone");
        fx.host.script_job(
            &id,
            [
                Err(HostError::Rejected {
                    status: 503,
                    message: "busy".into(),
                }),
                Err(HostError::Rejected {
                    status: 404,
                    message: "job gone not found".into(),
                }),
            ],
        );
        let handle = register(&fx, "gone", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();

        let job = handle.settled().await;
        assert_eq!(job.state, JobState::Error);
        assert!(!job.ambiguous);
        assert_eq!(job.error.as_deref(), Some("job gone not found"));
        assert_eq!(fx.host.count(&HostCall::Status(id.clone())), 2);

        // An unscripted job answers 404 on the first poll.
        let unknown = JobId::new("never-existed");
        let handle = register(&fx, "never-existed", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&unknown).unwrap();
        let job = handle.settled().await;
        assert!(!job.ambiguous);
        assert_eq!(fx.host.count(&HostCall::Status(unknown)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_resets_the_failure_count() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("j3");
        fx.host.script_job(
            &id,
            [
                transport("reset"),
                transport("reset"),
                transport("reset"),
                transport("reset"),
                Ok(JobStatusReport::running(10.0)),
                transport("reset"),
                transport("reset"),
                Ok(JobStatusReport::completed(json!({}))),
            ],
        );
        let handle = register(&fx, "j3", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();
        let job = handle.settled().await;
        assert_eq!(job.state, JobState::Completed);
        assert!(!job.ambiguous);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetches_count_as_failures() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("slow");
        fx.host
            .script_job(&id, [Ok(JobStatusReport::running(1.0))]);
        fx.host.set_status_latency(Some(Duration::from_secs(30)));
        let handle = register(&fx, "slow", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();

        let job = handle.settled().await;
        assert!(job.ambiguous);
        assert!(job.error.unwrap().contains("refresh manually"));
        let Some(OperationError::AmbiguousOutcome { last_error, .. }) = job.failure else {
            panic!("expected ambiguous failure");
        };
        assert!(last_error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_local_first_and_stops_the_loop() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("bench");
        fx.host
            .script_job(&id, [Ok(JobStatusReport::running(20.0))]);
        register(&fx, "bench", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();
        time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(fx.host.count(&HostCall::Status(id.clone())), 2);

        let job = fx.scheduler.cancel(&id).await.unwrap();
        assert_eq!(job.state, JobState::Canceled);
        assert!(job.settled_at.is_some());
        assert!(!fx.scheduler.is_polling(&id));
        assert_eq!(fx.host.count(&HostCall::Cancel(id.clone())), 1);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.host.count(&HostCall::Status(id.clone())), 2);
        assert_eq!(fx.recorder.settled.lock().len(), 1);
        assert!(matches!(
            fx.scheduler.cancel(&id).await,
            Err(OperationError::AlreadyTerminal {
                state: JobState::Canceled,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn response_landing_after_cancel_is_discarded() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("late");
        fx.host
            .script_job(&id, [Ok(JobStatusReport::completed(json!({ "success": true })))]);
        fx.host.set_status_latency(Some(Duration::from_millis(300)));
        register(&fx, "late", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();

        // First fetch starts at 500ms and would answer at 800ms.
        time::sleep(Duration::from_millis(600)).await;
        fx.scheduler.cancel(&id).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;

        let job = fx.registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Canceled);
        assert!(job.result.is_none());
        let settled = fx.recorder.settled.lock();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].state, JobState::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn one_loop_per_job() {
        let fx = fixture(ConvergenceSettings::default());
        let id = JobId::new("j1");
        fx.host
            .script_job(&id, [Ok(JobStatusReport::running(1.0))]);
        register(&fx, "j1", Tracking::HostJob);
        fx.scheduler.spawn_job_loop(&id).unwrap();
        assert!(matches!(
            fx.scheduler.spawn_job_loop(&id),
            Err(OperationError::Infrastructure(_))
        ));
        assert_eq!(fx.scheduler.shutdown(), 1);
        assert!(fx.scheduler.active_loops().is_empty());
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.host.count(&HostCall::Status(id)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn convergence_completes_when_reference_moves() {
        let fx = fixture(ConvergenceSettings::default());
        let probe = ConvergenceProbe::new(ResourceType::SystemVersion, &ConvergenceSettings::default());
        let baseline = probe.baseline(&json!({ "current_commit": "abc123", "update_available": true }));
        let unchanged = json!({ "current_commit": "abc123", "update_available": true });
        fx.host.script_resource(
            ResourceType::SystemVersion,
            [
                unchanged.clone(),
                unchanged.clone(),
                unchanged,
                json!({ "current_commit": "def456", "update_available": false }),
            ],
        );
        let id = JobId::local();
        let handle = fx
            .registry
            .register(
                id.clone(),
                ActionKind::SystemUpdate,
                ActionId::new_v4(),
                Tracking::Convergence,
            )
            .unwrap();
        fx.scheduler.spawn_convergence(&id, probe, baseline).unwrap();

        let job = handle.settled().await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(converged_reference(&job), Some(&json!("def456")));
        assert_eq!(job.result.as_ref().unwrap()["probes"], json!(4));
        assert_eq!(fx.host.count(&HostCall::Fetch(ResourceType::SystemVersion)), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn convergence_is_bounded_by_max_wait() {
        let settings = ConvergenceSettings {
            max_wait_secs: 3,
            ..ConvergenceSettings::default()
        };
        let fx = fixture(settings.clone());
        let probe = ConvergenceProbe::new(ResourceType::SystemVersion, &settings);
        let frozen = json!({ "current_commit": "abc123", "update_available": true });
        let baseline = probe.baseline(&frozen);
        fx.host.set_resource(ResourceType::SystemVersion, frozen);
        let id = JobId::local();
        let handle = fx
            .registry
            .register(
                id.clone(),
                ActionKind::SystemUpdate,
                ActionId::new_v4(),
                Tracking::Convergence,
            )
            .unwrap();
        fx.scheduler.spawn_convergence(&id, probe, baseline).unwrap();

        let job = handle.settled().await;
        assert_eq!(job.state, JobState::Error);
        assert!(job.ambiguous);
        let Some(OperationError::AmbiguousOutcome { last_error, .. }) = job.failure else {
            panic!("expected ambiguous failure");
        };
        assert!(last_error.contains("system_version did not change"));
    }
}
