use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hostdeck_event_bus::topics;
use hostdeck_logging::LogLevel;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time;

use crate::{
    actions::{ActionKind, OperationError, ResourceType},
    hostapi::{HostApi, HostError},
    jobs::JobId,
    telemetry::OperationsTelemetry,
};

/// Resource collections an action kind may change on the host.
#[must_use]
pub const fn affected_resources(kind: &ActionKind) -> &'static [ResourceType] {
    use ResourceType as R;
    match kind {
        ActionKind::PackageInstall
        | ActionKind::PackageRemove
        | ActionKind::PackageUpgrade
        | ActionKind::PackageAutoremove => &[R::PackageList, R::PackageUpdates],
        ActionKind::PackageIndexUpdate => &[R::PackageUpdates],
        ActionKind::PackageCacheClean => &[R::PackageList],
        ActionKind::PhpInstall | ActionKind::PhpRemove => &[R::PackageList, R::PhpVersions],
        ActionKind::Benchmark => &[R::BenchmarkResults],
        ActionKind::SystemUpdate => &[R::SystemVersion, R::PackageUpdates],
        ActionKind::CertificateIssue | ActionKind::CertificateRevoke => &[R::Certificates],
        ActionKind::ServiceStart | ActionKind::ServiceStop | ActionKind::ServiceRestart => {
            &[R::Services]
        }
        ActionKind::FirewallEnable | ActionKind::FirewallDisable | ActionKind::FirewallReset => {
            &[R::FirewallStatus, R::FirewallRules]
        }
        ActionKind::FirewallRuleDelete => &[R::FirewallRules],
        ActionKind::UserDelete => &[R::Users],
        ActionKind::WebsiteDelete => &[R::Websites],
        ActionKind::DatabaseDrop => &[R::Databases],
        ActionKind::DatabaseUserDrop => &[R::DatabaseUsers],
        ActionKind::InterfaceToggle | ActionKind::NetworkRestart => &[R::NetworkInterfaces],
        ActionKind::Custom(_) => &[],
    }
}

/// Cached view of one host resource collection or member. Readers hold an
/// `Arc` and never see a half-written value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Collection.
    pub resource_type: ResourceType,
    /// Member identity, absent for whole collections.
    pub identity: Option<String>,
    /// Strictly increasing across refreshes of the same collection.
    pub last_refreshed_at: DateTime<Utc>,
    /// Host payload.
    pub payload: Value,
    /// Sequence number of the refresh that produced this snapshot.
    pub sequence: u64,
}

/// What happened to a single refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The snapshot was swapped in.
    Refreshed(Arc<ResourceSnapshot>),
    /// A newer refresh had already landed; this result was dropped.
    Stale {
        /// Sequence of the dropped fetch.
        sequence: u64,
        /// Sequence of the snapshot kept.
        current: u64,
    },
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Types whose snapshot was replaced.
    pub refreshed: Vec<ResourceType>,
    /// Types whose fetch lost to a newer one.
    pub stale: Vec<ResourceType>,
    /// Types whose fetch failed; the previous snapshot is kept.
    pub failed: Vec<(ResourceType, OperationError)>,
}

impl ReconcileReport {
    /// Whether every affected type was fetched without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

type SnapshotKey = (ResourceType, Option<String>);

/// Owns resource snapshots and refreshes them after actions settle.
#[derive(Clone)]
pub struct StateReconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    host: Arc<dyn HostApi>,
    fetch_timeout: Duration,
    telemetry: OperationsTelemetry,
    snapshots: RwLock<HashMap<SnapshotKey, Arc<ResourceSnapshot>>>,
    sequence: AtomicU64,
}

impl fmt::Debug for StateReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateReconciler")
            .field("snapshots", &self.inner.snapshots.read().len())
            .field("sequence", &self.inner.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl StateReconciler {
    /// Creates an empty reconciler.
    #[must_use]
    pub fn new(
        host: Arc<dyn HostApi>,
        fetch_timeout: Duration,
        telemetry: OperationsTelemetry,
    ) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                host,
                fetch_timeout,
                telemetry,
                snapshots: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Refreshes every collection `kind` affects, one fetch per distinct type.
    ///
    /// Member snapshots of those types are dropped: the refreshed collection
    /// supersedes them until a member is fetched again.
    pub async fn reconcile(&self, kind: &ActionKind, trigger: Option<&JobId>) -> ReconcileReport {
        let types: BTreeSet<ResourceType> = affected_resources(kind).iter().copied().collect();
        let results = join_all(types.iter().map(|&resource_type| async move {
            (resource_type, self.refresh_for(resource_type, None, trigger).await)
        }))
        .await;
        self.inner
            .snapshots
            .write()
            .retain(|(resource_type, identity), _| identity.is_none() || !types.contains(resource_type));

        let mut report = ReconcileReport::default();
        for (resource_type, result) in results {
            match result {
                Ok(RefreshOutcome::Refreshed(_)) => report.refreshed.push(resource_type),
                Ok(RefreshOutcome::Stale { .. }) => report.stale.push(resource_type),
                Err(err) => report.failed.push((resource_type, err)),
            }
        }
        report
    }

    /// Re-fetches one collection on demand. Never touches any job.
    pub async fn refresh(&self, resource_type: ResourceType) -> Result<RefreshOutcome, OperationError> {
        self.refresh_for(resource_type, None, None).await
    }

    /// Fetches one member of a collection, e.g. a single service.
    pub async fn refresh_member(
        &self,
        resource_type: ResourceType,
        identity: &str,
    ) -> Result<RefreshOutcome, OperationError> {
        self.refresh_for(resource_type, Some(identity), None).await
    }

    /// Current snapshot of a collection.
    #[must_use]
    pub fn snapshot(&self, resource_type: ResourceType) -> Option<Arc<ResourceSnapshot>> {
        self.inner.snapshots.read().get(&(resource_type, None)).cloned()
    }

    /// Current snapshot of one member.
    #[must_use]
    pub fn member_snapshot(&self, resource_type: ResourceType, identity: &str) -> Option<Arc<ResourceSnapshot>> {
        self.inner
            .snapshots
            .read()
            .get(&(resource_type, Some(identity.to_string())))
            .cloned()
    }

    /// Every snapshot held, collections before their members.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Arc<ResourceSnapshot>> {
        let mut all: Vec<_> = self.inner.snapshots.read().values().cloned().collect();
        all.sort_by(|a, b| (a.resource_type, &a.identity).cmp(&(b.resource_type, &b.identity)));
        all
    }

    async fn refresh_for(
        &self,
        resource_type: ResourceType,
        identity: Option<&str>,
        trigger: Option<&JobId>,
    ) -> Result<RefreshOutcome, OperationError> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let wait = self.inner.fetch_timeout;
        let payload = time::timeout(wait, self.inner.host.fetch_resource(resource_type, identity))
            .await
            .unwrap_or(Err(HostError::Timeout(wait)))
            .map_err(|err| {
                self.inner.telemetry.record(
                    LogLevel::Warn,
                    topics::SNAPSHOT_FAILED,
                    trigger,
                    json!({
                        "resource": resource_type,
                        "identity": identity,
                        "sequence": sequence,
                        "error": err.to_string(),
                    }),
                );
                OperationError::from(err)
            })?;

        let key = (resource_type, identity.map(str::to_string));
        let outcome = self.install(key, sequence, payload);
        match &outcome {
            RefreshOutcome::Refreshed(snapshot) => self.inner.telemetry.record(
                LogLevel::Info,
                topics::SNAPSHOT_REFRESHED,
                trigger,
                json!({
                    "resource": resource_type,
                    "identity": identity,
                    "sequence": sequence,
                    "refreshed_at": snapshot.last_refreshed_at,
                }),
            ),
            RefreshOutcome::Stale { current, .. } => self.inner.telemetry.record(
                LogLevel::Debug,
                topics::SNAPSHOT_STALE,
                trigger,
                json!({
                    "resource": resource_type,
                    "identity": identity,
                    "sequence": sequence,
                    "current": current,
                }),
            ),
        }
        Ok(outcome)
    }

    fn install(&self, key: SnapshotKey, sequence: u64, payload: Value) -> RefreshOutcome {
        let mut snapshots = self.inner.snapshots.write();
        let previous = snapshots.get(&key);
        if let Some(current) = previous.filter(|current| current.sequence > sequence) {
            return RefreshOutcome::Stale {
                sequence,
                current: current.sequence,
            };
        }
        let now = Utc::now();
        let last_refreshed_at = previous.map_or(now, |prev| {
            now.max(prev.last_refreshed_at + chrono::Duration::microseconds(1))
        });
        let (resource_type, identity) = key;
        let snapshot = Arc::new(ResourceSnapshot {
            resource_type,
            identity: identity.clone(),
            last_refreshed_at,
            payload,
            sequence,
        });
        snapshots.insert((resource_type, identity), Arc::clone(&snapshot));
        RefreshOutcome::Refreshed(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostapi::{HostCall, SimulatedHost};

    fn reconciler(host: &SimulatedHost) -> StateReconciler {
        StateReconciler::new(
            Arc::new(host.clone()),
            Duration::from_secs(10),
            OperationsTelemetry::disabled(),
        )
    }

    #[test]
    fn static_map_covers_scenarios() {
        assert_eq!(
            affected_resources(&ActionKind::PhpInstall),
            &[ResourceType::PackageList, ResourceType::PhpVersions]
        );
        assert_eq!(
            affected_resources(&ActionKind::FirewallDisable),
            &[ResourceType::FirewallStatus, ResourceType::FirewallRules]
        );
        assert!(affected_resources(&ActionKind::SystemUpdate).contains(&ResourceType::SystemVersion));
        assert!(affected_resources(&ActionKind::Custom("noop".into())).is_empty());
    }

    #[tokio::test]
    async fn reconcile_fetches_each_type_once() {
        let host = SimulatedHost::new();
        host.set_resource(ResourceType::PhpVersions, json!({ "installed": ["8.3"] }));
        let reconciler = reconciler(&host);

        let report = reconciler.reconcile(&ActionKind::PhpInstall, None).await;
        assert!(report.is_clean());
        assert_eq!(
            report.refreshed,
            vec![ResourceType::PackageList, ResourceType::PhpVersions]
        );
        assert_eq!(host.count(&HostCall::Fetch(ResourceType::PackageList)), 1);
        assert_eq!(host.count(&HostCall::Fetch(ResourceType::PhpVersions)), 1);
        assert_eq!(host.total_calls(), 2);
        assert_eq!(
            reconciler
                .snapshot(ResourceType::PhpVersions)
                .unwrap()
                .payload,
            json!({ "installed": ["8.3"] })
        );

        let nothing = reconciler
            .reconcile(&ActionKind::Custom("noop".into()), None)
            .await;
        assert_eq!(nothing, ReconcileReport::default());
        assert_eq!(host.total_calls(), 2);
    }

    #[tokio::test]
    async fn refresh_timestamps_strictly_increase() {
        let host = SimulatedHost::new();
        let reconciler = reconciler(&host);
        let RefreshOutcome::Refreshed(first) = reconciler.refresh(ResourceType::Services).await.unwrap() else {
            panic!("expected refresh");
        };
        let RefreshOutcome::Refreshed(second) = reconciler.refresh(ResourceType::Services).await.unwrap() else {
            panic!("expected refresh");
        };
        assert!(second.last_refreshed_at > first.last_refreshed_at);
        assert!(second.sequence > first.sequence);
        assert_eq!(reconciler.snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn older_fetch_landing_late_is_discarded() {
        let host = SimulatedHost::new();
        host.script_resource(ResourceType::PackageList, [json!({ "v": 1 }), json!({ "v": 2 })]);
        host.set_fetch_latency(ResourceType::PackageList, Duration::from_secs(2));
        let reconciler = reconciler(&host);

        let slow = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.refresh(ResourceType::PackageList).await })
        };
        tokio::task::yield_now().await;
        host.set_fetch_latency(ResourceType::PackageList, Duration::ZERO);
        let fast = reconciler.refresh(ResourceType::PackageList).await.unwrap();
        assert!(matches!(fast, RefreshOutcome::Refreshed(ref snap) if snap.sequence == 2));

        let late = slow.await.unwrap().unwrap();
        assert_eq!(late, RefreshOutcome::Stale { sequence: 1, current: 2 });
        assert_eq!(
            reconciler.snapshot(ResourceType::PackageList).unwrap().sequence,
            2
        );
    }

    #[tokio::test]
    async fn member_snapshots_carry_their_identity() {
        let host = SimulatedHost::new();
        host.set_member(ResourceType::Services, "nginx", json!({ "active": false }));
        let reconciler = reconciler(&host);

        let RefreshOutcome::Refreshed(member) = reconciler
            .refresh_member(ResourceType::Services, "nginx")
            .await
            .unwrap()
        else {
            panic!("expected refresh");
        };
        assert_eq!(member.identity.as_deref(), Some("nginx"));
        assert!(reconciler.snapshot(ResourceType::Services).is_none());
        assert!(matches!(
            reconciler.refresh_member(ResourceType::Services, "apache2").await,
            Err(OperationError::Validation(_))
        ));

        reconciler.reconcile(&ActionKind::ServiceRestart, None).await;
        assert!(reconciler.member_snapshot(ResourceType::Services, "nginx").is_none());
        let collection = reconciler.snapshot(ResourceType::Services).unwrap();
        assert!(collection.identity.is_none());
        assert_eq!(reconciler.snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_previous_snapshot() {
        let host = SimulatedHost::new();
        host.set_resource(ResourceType::Users, json!({ "items": ["root"] }));
        let reconciler = StateReconciler::new(
            Arc::new(host.clone()),
            Duration::from_millis(100),
            OperationsTelemetry::disabled(),
        );
        reconciler.refresh(ResourceType::Users).await.unwrap();
        host.set_fetch_latency(ResourceType::Users, Duration::from_secs(1));

        let report = reconciler.reconcile(&ActionKind::UserDelete, None).await;
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, OperationError::Transport(_)));
        assert_eq!(
            reconciler.snapshot(ResourceType::Users).unwrap().payload,
            json!({ "items": ["root"] })
        );
    }
}
