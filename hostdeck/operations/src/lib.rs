#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Hostdeck operations core: dispatches host actions, tracks them to a
//! terminal outcome and keeps cached resource snapshots in step.

/// Actions, resource types and the error taxonomy.
#[path = "../actions.rs"]
pub mod actions;

/// Console settings loaded from TOML.
#[path = "../config.rs"]
pub mod config;

/// Destructive-action approval gate.
#[path = "../confirmation.rs"]
pub mod confirmation;

/// Convergence-based completion probes.
#[path = "../convergence.rs"]
pub mod convergence;

/// Action dispatch and settlement.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// Host API boundary and the scriptable simulated host.
#[path = "../hostapi.rs"]
pub mod hostapi;

/// Job registry and lifecycle.
#[path = "../jobs.rs"]
pub mod jobs;

/// Ephemeral notification feed.
#[path = "../notifications.rs"]
pub mod notifications;

/// Per-job poll loops.
#[path = "../poller.rs"]
pub mod poller;

/// Resource snapshots and reconciliation.
#[path = "../reconciler.rs"]
pub mod reconciler;

/// Session context object.
#[path = "../session.rs"]
pub mod session;

/// Telemetry helpers for operations.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Sample orchestration entrypoints and scripted scenarios.
#[path = "../main.rs"]
pub mod orchestration_entry;

/// Prelude exports for consumers that drive host operations.
pub mod prelude {
    pub use crate::actions::{
        Action, ActionBuilder, ActionId, ActionKind, OperationError, ResourceRef, ResourceType,
        SyncResult,
    };
    pub use crate::config::ConsoleSettings;
    pub use crate::confirmation::{ConfirmationGate, Decision, PendingConfirmation};
    pub use crate::dispatcher::{ActionDispatcher, ActionDispatcherBuilder, Submission};
    pub use crate::hostapi::{HostApi, HostError, JobStatusReport, SimulatedHost, SubmitResponse};
    pub use crate::jobs::{Job, JobHandle, JobId, JobRegistry, JobState};
    pub use crate::notifications::{Notification, NotificationCenter, Severity};
    pub use crate::reconciler::{ResourceSnapshot, StateReconciler};
    pub use crate::session::OperationsSession;
    pub use crate::telemetry::{OperationsTelemetry, OperationsTelemetryBuilder};
}
