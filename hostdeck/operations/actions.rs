use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::{JobId, JobState};

/// Identifier assigned to every action when it is built.
pub type ActionId = Uuid;

static PHP_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+$").unwrap());

const BENCHMARK_TYPES: &[&str] = &["cpu", "disk", "memory", "gpu"];
const INTERFACE_STATES: &[&str] = &["up", "down"];

/// Host operations the console knows how to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Install one or more apt packages.
    PackageInstall,
    /// Remove (optionally purge) apt packages.
    PackageRemove,
    /// Upgrade all or a subset of installed packages.
    PackageUpgrade,
    /// Remove packages that are no longer needed.
    PackageAutoremove,
    /// Refresh the package index.
    PackageIndexUpdate,
    /// Clean the local package cache.
    PackageCacheClean,
    /// Install a PHP runtime version.
    PhpInstall,
    /// Remove a PHP runtime version.
    PhpRemove,
    /// Run a cpu/disk/memory/gpu benchmark.
    Benchmark,
    /// Pull and apply the console's own update in the background.
    SystemUpdate,
    /// Issue a TLS certificate for a domain.
    CertificateIssue,
    /// Revoke a TLS certificate.
    CertificateRevoke,
    /// Start a systemd unit.
    ServiceStart,
    /// Stop a systemd unit.
    ServiceStop,
    /// Restart a systemd unit.
    ServiceRestart,
    /// Enable the firewall.
    FirewallEnable,
    /// Disable the firewall.
    FirewallDisable,
    /// Remove every firewall rule.
    FirewallReset,
    /// Delete a numbered firewall rule.
    FirewallRuleDelete,
    /// Delete a system user.
    UserDelete,
    /// Delete a web server site.
    WebsiteDelete,
    /// Drop a database.
    DatabaseDrop,
    /// Drop a database account.
    DatabaseUserDrop,
    /// Bring a network interface up or down.
    InterfaceToggle,
    /// Restart networking services.
    NetworkRestart,
    /// Operator supplied kind with no known resource footprint.
    Custom(String),
}

/// How the core learns that an action has finished on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionMode {
    /// The host answers with a job id or an immediate result.
    HostJob,
    /// No job id: completion is inferred from a change in a reference value.
    Convergence(ResourceType),
}

impl ActionKind {
    /// Stable dotted label, used in logs and event payloads.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::PackageInstall => "package.install",
            Self::PackageRemove => "package.remove",
            Self::PackageUpgrade => "package.upgrade",
            Self::PackageAutoremove => "package.autoremove",
            Self::PackageIndexUpdate => "package.index_update",
            Self::PackageCacheClean => "package.cache_clean",
            Self::PhpInstall => "php.install",
            Self::PhpRemove => "php.remove",
            Self::Benchmark => "system.benchmark",
            Self::SystemUpdate => "system.update",
            Self::CertificateIssue => "certificate.issue",
            Self::CertificateRevoke => "certificate.revoke",
            Self::ServiceStart => "service.start",
            Self::ServiceStop => "service.stop",
            Self::ServiceRestart => "service.restart",
            Self::FirewallEnable => "firewall.enable",
            Self::FirewallDisable => "firewall.disable",
            Self::FirewallReset => "firewall.reset",
            Self::FirewallRuleDelete => "firewall.rule_delete",
            Self::UserDelete => "user.delete",
            Self::WebsiteDelete => "website.delete",
            Self::DatabaseDrop => "database.drop",
            Self::DatabaseUserDrop => "database.user_drop",
            Self::InterfaceToggle => "network.interface_toggle",
            Self::NetworkRestart => "network.restart",
            Self::Custom(label) => label,
        }
    }

    /// Whether the action is irreversible enough to require confirmation by default.
    #[must_use]
    pub const fn destructive_by_default(&self) -> bool {
        matches!(
            self,
            Self::PackageRemove
                | Self::PhpRemove
                | Self::CertificateRevoke
                | Self::ServiceStop
                | Self::FirewallDisable
                | Self::FirewallReset
                | Self::FirewallRuleDelete
                | Self::UserDelete
                | Self::WebsiteDelete
                | Self::DatabaseDrop
                | Self::DatabaseUserDrop
                | Self::InterfaceToggle
                | Self::NetworkRestart
        )
    }

    /// Parameters that must be present and non-empty.
    #[must_use]
    pub const fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::PackageInstall | Self::PackageRemove => &["packages"],
            Self::PhpInstall | Self::PhpRemove => &["version"],
            Self::Benchmark => &["type"],
            Self::CertificateIssue | Self::CertificateRevoke => &["domain"],
            Self::ServiceStart | Self::ServiceStop | Self::ServiceRestart => &["service"],
            Self::FirewallRuleDelete => &["rule"],
            Self::UserDelete => &["username"],
            Self::WebsiteDelete => &["site"],
            Self::DatabaseDrop => &["database"],
            Self::DatabaseUserDrop => &["username", "host"],
            Self::InterfaceToggle => &["interface", "state"],
            Self::PackageUpgrade
            | Self::PackageAutoremove
            | Self::PackageIndexUpdate
            | Self::PackageCacheClean
            | Self::SystemUpdate
            | Self::FirewallEnable
            | Self::FirewallDisable
            | Self::FirewallReset
            | Self::NetworkRestart
            | Self::Custom(_) => &[],
        }
    }

    /// Completion tracking strategy for this kind.
    #[must_use]
    pub const fn completion_mode(&self) -> CompletionMode {
        match self {
            Self::SystemUpdate => CompletionMode::Convergence(ResourceType::SystemVersion),
            _ => CompletionMode::HostJob,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Host resource collections the console caches as snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Installed packages.
    PackageList,
    /// Pending package upgrades.
    PackageUpdates,
    /// Installed and available PHP versions.
    PhpVersions,
    /// Recent benchmark results.
    BenchmarkResults,
    /// Console version and update availability.
    SystemVersion,
    /// Systemd units.
    Services,
    /// Firewall enabled/disabled state.
    FirewallStatus,
    /// Firewall rule table.
    FirewallRules,
    /// TLS certificates.
    Certificates,
    /// Web server sites.
    Websites,
    /// Databases.
    Databases,
    /// Database accounts.
    DatabaseUsers,
    /// System users.
    Users,
    /// Network interfaces.
    NetworkInterfaces,
}

impl ResourceType {
    /// Every resource type, in declaration order.
    pub const ALL: [Self; 14] = [
        Self::PackageList,
        Self::PackageUpdates,
        Self::PhpVersions,
        Self::BenchmarkResults,
        Self::SystemVersion,
        Self::Services,
        Self::FirewallStatus,
        Self::FirewallRules,
        Self::Certificates,
        Self::Websites,
        Self::Databases,
        Self::DatabaseUsers,
        Self::Users,
        Self::NetworkInterfaces,
    ];

    /// Snake-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PackageList => "package_list",
            Self::PackageUpdates => "package_updates",
            Self::PhpVersions => "php_versions",
            Self::BenchmarkResults => "benchmark_results",
            Self::SystemVersion => "system_version",
            Self::Services => "services",
            Self::FirewallStatus => "firewall_status",
            Self::FirewallRules => "firewall_rules",
            Self::Certificates => "certificates",
            Self::Websites => "websites",
            Self::Databases => "databases",
            Self::DatabaseUsers => "database_users",
            Self::Users => "users",
            Self::NetworkInterfaces => "network_interfaces",
        }
    }

    /// Parses a snake-case label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reference to the resource an action targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Collection the resource lives in.
    pub resource_type: ResourceType,
    /// Identity within the collection, absent for collection-wide actions.
    pub identity: Option<String>,
}

impl ResourceRef {
    /// Collection-wide reference.
    #[must_use]
    pub const fn collection(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            identity: None,
        }
    }

    /// Reference to a single member of a collection.
    #[must_use]
    pub fn member(resource_type: ResourceType, identity: impl Into<String>) -> Self {
        Self {
            resource_type,
            identity: Some(identity.into()),
        }
    }
}

/// An operator intent, immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Unique identifier.
    pub id: ActionId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Operation to perform.
    pub kind: ActionKind,
    /// Resource the operation targets.
    pub target: ResourceRef,
    /// Request parameters forwarded to the host.
    pub params: IndexMap<String, Value>,
    /// Requires confirmation before dispatch.
    pub destructive: bool,
    /// Optional operator identity, for the audit trail only.
    pub requester: Option<String>,
}

impl Action {
    /// Starts a builder for `kind` targeting `target`.
    #[must_use]
    pub fn builder(kind: ActionKind, target: ResourceRef) -> ActionBuilder {
        let destructive = kind.destructive_by_default();
        ActionBuilder {
            action: Self {
                id: ActionId::new_v4(),
                created_at: Utc::now(),
                kind,
                target,
                params: IndexMap::new(),
                destructive,
                requester: None,
            },
        }
    }

    /// Reads a string parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Checks parameters without touching anything.
    pub fn validate(&self) -> Result<(), OperationError> {
        for key in self.kind.required_params() {
            match self.params.get(*key) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!(
                        "{} requires parameter `{key}`",
                        self.kind
                    )))
                }
                Some(Value::String(text)) if text.trim().is_empty() => {
                    return Err(invalid(format!("parameter `{key}` must not be empty")))
                }
                Some(Value::Array(items)) if items.is_empty() => {
                    return Err(invalid(format!("parameter `{key}` must not be empty")))
                }
                Some(_) => {}
            }
        }

        match &self.kind {
            ActionKind::PackageInstall | ActionKind::PackageRemove => {
                self.string_list("packages")?;
            }
            ActionKind::PackageUpgrade => {
                if self.params.contains_key("packages") {
                    self.string_list("packages")?;
                }
            }
            ActionKind::PhpInstall | ActionKind::PhpRemove => {
                let version = self.string("version")?;
                if !PHP_VERSION.is_match(version) {
                    return Err(invalid(format!(
                        "php version `{version}` must look like 8.3"
                    )));
                }
            }
            ActionKind::Benchmark => self.validate_benchmark()?,
            ActionKind::FirewallRuleDelete => {
                self.bounded_int("rule", 1, u64::from(u16::MAX))?;
            }
            ActionKind::InterfaceToggle => {
                let state = self.string("state")?;
                if !INTERFACE_STATES.contains(&state) {
                    return Err(invalid(format!(
                        "interface state `{state}` must be one of {INTERFACE_STATES:?}"
                    )));
                }
            }
            ActionKind::Custom(label) => {
                if label.trim().is_empty() {
                    return Err(invalid("custom action label must not be empty"));
                }
            }
            _ => {
                for key in self.kind.required_params() {
                    self.string(key)?;
                }
            }
        }
        Ok(())
    }

    fn validate_benchmark(&self) -> Result<(), OperationError> {
        let kind = self.string("type")?;
        if !BENCHMARK_TYPES.contains(&kind) {
            return Err(invalid(format!(
                "benchmark type `{kind}` must be one of {BENCHMARK_TYPES:?}"
            )));
        }
        if self.params.contains_key("duration") {
            self.bounded_int("duration", 1, 600)?;
        }
        if self.params.contains_key("size_mb") {
            self.bounded_int("size_mb", 1, 65_536)?;
        }
        if self.params.contains_key("threads") {
            self.bounded_int("threads", 1, 1024)?;
        }
        Ok(())
    }

    fn string(&self, key: &str) -> Result<&str, OperationError> {
        self.param_str(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| invalid(format!("parameter `{key}` must be a non-empty string")))
    }

    fn string_list(&self, key: &str) -> Result<Vec<&str>, OperationError> {
        let items = self
            .params
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(format!("parameter `{key}` must be a list of names")))?;
        if items.is_empty() {
            return Err(invalid(format!("parameter `{key}` must not be empty")));
        }
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| invalid(format!("parameter `{key}` contains a blank entry")))
            })
            .collect()
    }

    fn bounded_int(&self, key: &str, min: u64, max: u64) -> Result<u64, OperationError> {
        let value = self
            .params
            .get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid(format!("parameter `{key}` must be a positive integer")))?;
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(invalid(format!(
                "parameter `{key}` = {value} outside {min}..={max}"
            )))
        }
    }
}

fn invalid(message: impl Into<String>) -> OperationError {
    OperationError::Validation(message.into())
}

/// Builder used to construct actions fluently.
#[derive(Debug)]
pub struct ActionBuilder {
    action: Action,
}

impl ActionBuilder {
    /// Sets a parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.action.params.insert(key.into(), value.into());
        self
    }

    /// Overrides the kind's default destructive flag.
    #[must_use]
    pub const fn destructive(mut self, destructive: bool) -> Self {
        self.action.destructive = destructive;
        self
    }

    /// Records the requester.
    #[must_use]
    pub fn requester(mut self, requester: impl Into<String>) -> Self {
        self.action.requester = Some(requester.into());
        self
    }

    /// Finalizes the action.
    #[must_use]
    pub fn build(self) -> Action {
        self.action
    }
}

/// Result of an action the host completed synchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Action that produced the result.
    pub action_id: ActionId,
    /// Kind of that action.
    pub kind: ActionKind,
    /// Host payload.
    pub payload: Value,
    /// Time the result was received.
    pub received_at: DateTime<Utc>,
}

/// Error taxonomy surfaced by the operations core.
#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationError {
    /// The action is malformed; nothing was sent.
    #[error("invalid action: {0}")]
    Validation(String),
    /// Network or 5xx failure while talking to the host.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The host reported the job as failed; message is verbatim.
    #[error("job {job_id} failed on host: {message}")]
    ServerJobFailure {
        /// Failed job.
        job_id: JobId,
        /// Host supplied message.
        message: String,
    },
    /// Polling gave up while the host-side operation may still be running.
    #[error("outcome of job {job_id} unknown after {attempts} failed status checks, refresh manually")]
    AmbiguousOutcome {
        /// Job whose outcome is unknown.
        job_id: JobId,
        /// Consecutive failed status checks.
        attempts: u32,
        /// Last transport error seen.
        last_error: String,
    },
    /// Another destructive action is already waiting for approval.
    #[error("another confirmation is already pending")]
    ConfirmationPending,
    /// The operator rejected the confirmation.
    #[error("confirmation rejected")]
    ConfirmationRejected,
    /// Resolve/reject was called without a matching pending confirmation.
    #[error("no matching confirmation is pending")]
    NoPendingConfirmation,
    /// The job id is not (or no longer) in the registry.
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    /// The job already reached a terminal state.
    #[error("job {job_id} is already {state}")]
    AlreadyTerminal {
        /// Job id.
        job_id: JobId,
        /// Its terminal state.
        state: JobState,
    },
    /// Internal failure of the core itself.
    #[error("infrastructure: {0}")]
    Infrastructure(String),
}

impl OperationError {
    /// Whether the error left the host untouched.
    #[must_use]
    pub const fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::ConfirmationPending
                | Self::ConfirmationRejected
                | Self::NoPendingConfirmation
        )
    }
}

/// Converts a `std::time::Duration` to milliseconds for log payloads.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn php(version: &str) -> Action {
        Action::builder(
            ActionKind::PhpInstall,
            ResourceRef::collection(ResourceType::PhpVersions),
        )
        .param("version", version)
        .build()
    }

    #[test]
    fn builder_takes_destructive_default_from_kind() {
        let disable = Action::builder(
            ActionKind::FirewallDisable,
            ResourceRef::collection(ResourceType::FirewallStatus),
        )
        .build();
        assert!(disable.destructive);

        let install = php("8.3");
        assert!(!install.destructive);

        let forced = Action::builder(
            ActionKind::ServiceRestart,
            ResourceRef::member(ResourceType::Services, "nginx"),
        )
        .param("service", "nginx")
        .destructive(true)
        .requester("ops")
        .build();
        assert!(forced.destructive);
        assert_eq!(forced.requester.as_deref(), Some("ops"));
    }

    #[test]
    fn validates_php_versions() {
        assert!(php("8.3").validate().is_ok());
        assert!(matches!(
            php("latest").validate(),
            Err(OperationError::Validation(_))
        ));
        let missing = Action::builder(
            ActionKind::PhpInstall,
            ResourceRef::collection(ResourceType::PhpVersions),
        )
        .build();
        let err = missing.validate().unwrap_err();
        assert!(err.to_string().contains("version"));
        assert!(err.is_side_effect_free());
    }

    #[test]
    fn validates_package_lists() {
        let target = ResourceRef::collection(ResourceType::PackageList);
        let ok = Action::builder(ActionKind::PackageInstall, target.clone())
            .param("packages", json!(["nginx", "curl"]))
            .build();
        assert!(ok.validate().is_ok());

        let empty = Action::builder(ActionKind::PackageInstall, target.clone())
            .param("packages", json!([]))
            .build();
        assert!(empty.validate().is_err());

        let blank = Action::builder(ActionKind::PackageRemove, target.clone())
            .param("packages", json!(["nginx", " "]))
            .build();
        assert!(blank.validate().is_err());

        let upgrade_all = Action::builder(ActionKind::PackageUpgrade, target).build();
        assert!(upgrade_all.validate().is_ok());
    }

    #[test]
    fn validates_benchmark_bounds() {
        let target = ResourceRef::collection(ResourceType::BenchmarkResults);
        let ok = Action::builder(ActionKind::Benchmark, target.clone())
            .param("type", "disk")
            .param("duration", 10)
            .param("size_mb", 256)
            .build();
        assert!(ok.validate().is_ok());

        let bad_type = Action::builder(ActionKind::Benchmark, target.clone())
            .param("type", "network")
            .build();
        assert!(bad_type.validate().is_err());

        let too_long = Action::builder(ActionKind::Benchmark, target)
            .param("type", "cpu")
            .param("duration", 3600)
            .build();
        assert!(too_long
            .validate()
            .unwrap_err()
            .to_string()
            .contains("duration"));
    }

    #[test]
    fn validates_interface_and_rule_params() {
        let toggle = Action::builder(
            ActionKind::InterfaceToggle,
            ResourceRef::member(ResourceType::NetworkInterfaces, "eth0"),
        )
        .param("interface", "eth0")
        .param("state", "sideways")
        .build();
        assert!(toggle.validate().is_err());

        let rule = Action::builder(
            ActionKind::FirewallRuleDelete,
            ResourceRef::member(ResourceType::FirewallRules, "3"),
        )
        .param("rule", 3)
        .build();
        assert!(rule.validate().is_ok());

        let custom = Action::builder(
            ActionKind::Custom("  ".into()),
            ResourceRef::collection(ResourceType::Services),
        )
        .build();
        assert!(custom.validate().is_err());
    }

    #[test]
    fn system_update_converges_on_version() {
        assert_eq!(
            ActionKind::SystemUpdate.completion_mode(),
            CompletionMode::Convergence(ResourceType::SystemVersion)
        );
        assert_eq!(
            ActionKind::PhpInstall.completion_mode(),
            CompletionMode::HostJob
        );
        assert_eq!(
            ResourceType::from_label("php_versions"),
            Some(ResourceType::PhpVersions)
        );
    }
}
