use std::{fmt, sync::Arc};

use anyhow::Result;
use hostdeck_event_bus::{EventPublisher, FanoutPublisher, FileEventPublisher, MemoryEventBus};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    actions::{Action, OperationError, ResourceType},
    confirmation::PendingConfirmation,
    config::ConsoleSettings,
    dispatcher::{ActionDispatcher, Submission},
    hostapi::HostApi,
    jobs::{Job, JobCallback, JobId, SubscriptionId},
    notifications::Notification,
    reconciler::{RefreshOutcome, ResourceSnapshot},
    telemetry::OperationsTelemetry,
};

/// One operator session: a registry, a gate, a snapshot store and an event
/// bus, passed around by reference instead of living in globals.
pub struct OperationsSession {
    settings: ConsoleSettings,
    bus: Arc<MemoryEventBus>,
    dispatcher: ActionDispatcher,
}

impl fmt::Debug for OperationsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationsSession")
            .field("dispatcher", &self.dispatcher)
            .field("bus_capacity", &self.bus.capacity())
            .finish_non_exhaustive()
    }
}

impl OperationsSession {
    /// Wires a session against `host`.
    pub fn new(settings: ConsoleSettings, host: Arc<dyn HostApi>) -> Result<Self> {
        settings.validate()?;
        let bus = Arc::new(MemoryEventBus::new(settings.telemetry.bus_capacity));
        let publisher: Arc<dyn EventPublisher> = match &settings.telemetry.event_log {
            Some(path) => Arc::new(
                FanoutPublisher::new()
                    .with(bus.clone())
                    .with(Arc::new(FileEventPublisher::new(path)?)),
            ),
            None => bus.clone(),
        };
        let mut telemetry = OperationsTelemetry::builder("operations")
            .min_level(settings.telemetry.min_level()?)
            .event_publisher(publisher);
        if let Some(path) = &settings.telemetry.log_path {
            telemetry = telemetry.log_path(path);
        }
        let dispatcher = ActionDispatcher::builder(host)
            .settings(settings.clone())
            .telemetry(telemetry.build()?)
            .build();
        Ok(Self {
            settings,
            bus,
            dispatcher,
        })
    }

    /// Settings the session was built with.
    #[must_use]
    pub const fn settings(&self) -> &ConsoleSettings {
        &self.settings
    }

    /// Submits an action.
    pub async fn submit(&self, action: Action) -> Result<Submission, OperationError> {
        self.dispatcher.submit(action).await
    }

    /// Calls `callback` after every change to job `id`.
    pub fn subscribe(&self, id: &JobId, callback: JobCallback) -> Result<SubscriptionId, OperationError> {
        let registry = self.dispatcher.registry();
        if registry.get(id).is_none() {
            return Err(OperationError::UnknownJob(id.clone()));
        }
        Ok(registry.subscribe(id, callback))
    }

    /// Drops a subscription.
    pub fn unsubscribe(&self, token: SubscriptionId) -> bool {
        self.dispatcher.registry().unsubscribe(token)
    }

    /// Stream of the confirmation slot, for rendering approval prompts.
    #[must_use]
    pub fn confirmation_stream(&self) -> watch::Receiver<Option<PendingConfirmation>> {
        self.dispatcher.gate().stream()
    }

    /// Approves the pending confirmation.
    pub fn resolve(&self, id: Uuid) -> Result<(), OperationError> {
        self.dispatcher.gate().resolve(id)
    }

    /// Rejects the pending confirmation.
    pub fn reject(&self, id: Uuid) -> Result<(), OperationError> {
        self.dispatcher.gate().reject(id)
    }

    /// Latest snapshot of a collection.
    #[must_use]
    pub fn resource_snapshot(&self, resource_type: ResourceType) -> Option<Arc<ResourceSnapshot>> {
        self.dispatcher.reconciler().snapshot(resource_type)
    }

    /// Re-fetches a collection on demand.
    pub async fn refresh(&self, resource_type: ResourceType) -> Result<RefreshOutcome, OperationError> {
        self.dispatcher.refresh(resource_type).await
    }

    /// Re-fetches one member of a collection on demand.
    pub async fn refresh_member(
        &self,
        resource_type: ResourceType,
        identity: &str,
    ) -> Result<RefreshOutcome, OperationError> {
        self.dispatcher.reconciler().refresh_member(resource_type, identity).await
    }

    /// Latest snapshot of one collection member.
    #[must_use]
    pub fn member_snapshot(&self, resource_type: ResourceType, identity: &str) -> Option<Arc<ResourceSnapshot>> {
        self.dispatcher.reconciler().member_snapshot(resource_type, identity)
    }

    /// Cancels a job.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, OperationError> {
        self.dispatcher.cancel(id).await
    }

    /// Current view of a job.
    #[must_use]
    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.dispatcher.registry().get(id)
    }

    /// Jobs still queued or running.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<Job> {
        self.dispatcher.registry().list_active()
    }

    /// Live notification entries.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.dispatcher.notifications().active()
    }

    /// Dismisses a notification.
    pub fn dismiss(&self, id: Uuid) -> bool {
        self.dispatcher.notifications().dismiss(id)
    }

    /// Session event bus.
    #[must_use]
    pub const fn events(&self) -> &Arc<MemoryEventBus> {
        &self.bus
    }

    /// Underlying dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Stops every poll loop.
    pub fn shutdown(&self) -> usize {
        self.dispatcher.shutdown()
    }
}
