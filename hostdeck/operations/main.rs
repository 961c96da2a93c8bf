use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    actions::{Action, ActionKind, OperationError, ResourceRef, ResourceType},
    config::ConsoleSettings,
    dispatcher::Submission,
    hostapi::{HostError, JobStatusReport, SimulatedHost, SubmitResponse},
    jobs::{Job, JobId},
    notifications::Notification,
    reconciler::affected_resources,
    session::OperationsSession,
};

/// Scripted end-to-end runs against a [`SimulatedHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Install PHP 8.3 as a polled host job.
    InstallPhp,
    /// Disable the firewall behind the confirmation gate.
    DisableFirewall,
    /// Background self-update tracked by convergence.
    SystemUpdate,
    /// A job whose status endpoint keeps failing.
    FlakyJob,
}

impl Scenario {
    /// Every scenario.
    pub const ALL: [Self; 4] = [
        Self::InstallPhp,
        Self::DisableFirewall,
        Self::SystemUpdate,
        Self::FlakyJob,
    ];

    /// CLI name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InstallPhp => "install-php",
            Self::DisableFirewall => "disable-firewall",
            Self::SystemUpdate => "system-update",
            Self::FlakyJob => "flaky-job",
        }
    }

    /// The action the scenario submits.
    #[must_use]
    pub fn action(self) -> Action {
        match self {
            Self::InstallPhp => Action::builder(
                ActionKind::PhpInstall,
                ResourceRef::collection(ResourceType::PhpVersions),
            )
            .param("version", "8.3")
            .requester("opsctl")
            .build(),
            Self::DisableFirewall => Action::builder(
                ActionKind::FirewallDisable,
                ResourceRef::collection(ResourceType::FirewallStatus),
            )
            .requester("opsctl")
            .build(),
            Self::SystemUpdate => Action::builder(
                ActionKind::SystemUpdate,
                ResourceRef::collection(ResourceType::SystemVersion),
            )
            .requester("opsctl")
            .build(),
            Self::FlakyJob => Action::builder(
                ActionKind::PackageInstall,
                ResourceRef::collection(ResourceType::PackageList),
            )
            .param("packages", json!(["nginx"]))
            .requester("opsctl")
            .build(),
        }
    }

    /// Scripts `host` for this scenario.
    pub fn prepare(self, host: &SimulatedHost) {
        match self {
            Self::InstallPhp => {
                let id = JobId::new("j1");
                host.respond_to(
                    &ActionKind::PhpInstall,
                    Ok(SubmitResponse::Job { job_id: id.clone() }),
                );
                host.script_job(
                    &id,
                    [
                        Ok(JobStatusReport::running(40.0)),
                        Ok(JobStatusReport::completed(json!({ "success": true }))),
                    ],
                );
                host.set_resource(
                    ResourceType::PhpVersions,
                    json!({ "installed": ["8.2", "8.3"] }),
                );
            }
            Self::DisableFirewall => {
                host.set_resource(ResourceType::FirewallStatus, json!({ "enabled": false }));
            }
            Self::SystemUpdate => {
                let old = json!({ "current_commit": "abc123", "update_available": true });
                host.script_resource(
                    ResourceType::SystemVersion,
                    [
                        old.clone(),
                        old.clone(),
                        old.clone(),
                        old,
                        json!({ "current_commit": "def456", "update_available": false }),
                    ],
                );
            }
            Self::FlakyJob => {
                let id = JobId::new("j2");
                host.respond_to(
                    &ActionKind::PackageInstall,
                    Ok(SubmitResponse::Job { job_id: id.clone() }),
                );
                host.script_job(&id, [Err(HostError::Transport("connection reset".into()))]);
            }
        }
    }
}

impl std::str::FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == name)
            .with_context(|| format!("unknown scenario `{name}`"))
    }
}

/// What a scenario run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Scenario name.
    pub scenario: &'static str,
    /// Final job view, for job-backed runs.
    pub job: Option<Job>,
    /// Synchronous result payload, if the host answered immediately.
    pub immediate: Option<Value>,
    /// Error returned by `submit`, if any.
    pub error: Option<OperationError>,
    /// Snapshots of every collection the action affects.
    pub snapshots: Value,
    /// Live notifications at the end of the run.
    pub notifications: Vec<Notification>,
    /// Number of calls the host observed.
    pub host_calls: usize,
}

/// Runs `scenario` in a fresh session. `approve` answers the confirmation gate.
pub async fn run_scenario(
    scenario: Scenario,
    settings: ConsoleSettings,
    approve: bool,
) -> Result<ScenarioReport> {
    let host = SimulatedHost::new();
    scenario.prepare(&host);
    let session = Arc::new(OperationsSession::new(settings, Arc::new(host.clone()))?);

    let answer = {
        let session = Arc::clone(&session);
        let mut stream = session.confirmation_stream();
        tokio::spawn(async move {
            let pending = stream.wait_for(Option::is_some).await.ok()?.clone()?;
            tracing::info!(prompt = %pending.prompt, approve, "answering confirmation");
            let answered = if approve {
                session.resolve(pending.id)
            } else {
                session.reject(pending.id)
            };
            answered.ok()
        })
    };

    let action = scenario.action();
    let kind = action.kind.clone();
    let (job, immediate, error) = match session.submit(action).await {
        Ok(Submission::Job(handle)) => {
            let id = handle.current().id;
            let token = session
                .subscribe(
                    &id,
                    Arc::new(|job: &Job| {
                        tracing::info!(
                            job_id = %job.id,
                            state = job.state.label(),
                            progress = ?job.progress,
                            "job update"
                        );
                    }),
                )
                .ok();
            let settled = handle.settled().await;
            if let Some(token) = token {
                session.unsubscribe(token);
            }
            for notification in session.notifications() {
                tracing::info!(severity = ?notification.severity, text = %notification.text, "notification");
            }
            (Some(settled), None, None)
        }
        Ok(Submission::Sync(result)) => (None, Some(result.payload), None),
        Err(err) => (None, None, Some(err)),
    };
    answer.abort();

    let snapshots = affected_resources(&kind)
        .iter()
        .map(|resource_type| {
            let payload = session
                .resource_snapshot(*resource_type)
                .map(|snapshot| json!({
                    "payload": snapshot.payload,
                    "last_refreshed_at": snapshot.last_refreshed_at,
                }));
            (resource_type.label().to_string(), payload.unwrap_or(Value::Null))
        })
        .collect::<serde_json::Map<_, _>>();

    session.shutdown();
    Ok(ScenarioReport {
        scenario: scenario.name(),
        job,
        immediate,
        error,
        snapshots: Value::Object(snapshots),
        notifications: session.notifications(),
        host_calls: host.total_calls(),
    })
}

/// Installs PHP end to end against a simulated host.
pub async fn orchestrate_sample() -> Result<()> {
    let report = run_scenario(Scenario::InstallPhp, ConsoleSettings::default(), true).await?;
    if let Some(err) = report.error {
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;

    #[test]
    fn scenarios_parse_by_name() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }
        assert!("reboot".parse::<Scenario>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn install_php_sample_runs() {
        orchestrate_sample().await.unwrap();
        let report = run_scenario(Scenario::InstallPhp, ConsoleSettings::default(), true)
            .await
            .unwrap();
        assert_eq!(report.job.unwrap().state, JobState::Completed);
        assert_eq!(
            report.snapshots["php_versions"]["payload"],
            json!({ "installed": ["8.2", "8.3"] })
        );
    }

    #[tokio::test]
    async fn unapproved_firewall_change_is_rejected() {
        let report = run_scenario(Scenario::DisableFirewall, ConsoleSettings::default(), false)
            .await
            .unwrap();
        assert_eq!(report.error, Some(OperationError::ConfirmationRejected));
        assert_eq!(report.host_calls, 0);
        assert!(report.snapshots["firewall_status"].is_null());

        let approved = run_scenario(Scenario::DisableFirewall, ConsoleSettings::default(), true)
            .await
            .unwrap();
        assert!(approved.error.is_none());
        assert_eq!(
            approved.snapshots["firewall_status"]["payload"],
            json!({ "enabled": false })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_job_reports_ambiguity() {
        let report = run_scenario(Scenario::FlakyJob, ConsoleSettings::default(), true)
            .await
            .unwrap();
        let job = report.job.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert!(job.ambiguous);
    }
}
