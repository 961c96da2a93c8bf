use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use hostdeck_event_bus::topics;
use hostdeck_logging::LogLevel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::{
    actions::{Action, OperationError},
    telemetry::OperationsTelemetry,
};

/// A destructive action waiting for a human answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    /// Identifier passed back to `resolve`/`reject`.
    pub id: Uuid,
    /// The held action.
    pub action: Action,
    /// When the gate was raised.
    pub requested_at: DateTime<Utc>,
    /// Human readable prompt.
    pub prompt: String,
}

/// Answer delivered to the waiting submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Proceed with the action.
    Approved,
    /// Abort without side effects.
    Rejected,
}

impl Decision {
    const fn label(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

struct Slot {
    pending: PendingConfirmation,
    responder: oneshot::Sender<Decision>,
}

struct GateInner {
    slot: Mutex<Option<Slot>>,
    stream: watch::Sender<Option<PendingConfirmation>>,
    telemetry: OperationsTelemetry,
}

impl GateInner {
    fn take_if(&self, id: Uuid) -> Option<Slot> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|held| held.pending.id == id) {
            let taken = slot.take();
            self.stream.send_replace(None);
            taken
        } else {
            None
        }
    }
}

/// Single-slot approval step for destructive actions.
///
/// There is no timeout: a raised confirmation stays open until someone
/// answers it or the submitter goes away.
#[derive(Clone)]
pub struct ConfirmationGate {
    inner: Arc<GateInner>,
}

impl fmt::Debug for ConfirmationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationGate")
            .field("pending", &self.pending().map(|pending| pending.id))
            .finish()
    }
}

impl ConfirmationGate {
    /// Creates an empty gate.
    #[must_use]
    pub fn new(telemetry: OperationsTelemetry) -> Self {
        let (stream, _) = watch::channel(None);
        Self {
            inner: Arc::new(GateInner {
                slot: Mutex::new(None),
                stream,
                telemetry,
            }),
        }
    }

    /// Raises a confirmation for `action`.
    ///
    /// Fails with [`OperationError::ConfirmationPending`] while another one is open.
    pub fn request(&self, action: &Action) -> Result<ConfirmationTicket, OperationError> {
        let mut slot = self.inner.slot.lock();
        if slot.is_some() {
            return Err(OperationError::ConfirmationPending);
        }
        let pending = PendingConfirmation {
            id: Uuid::new_v4(),
            action: action.clone(),
            requested_at: Utc::now(),
            prompt: prompt(action),
        };
        let (responder, receiver) = oneshot::channel();
        let id = pending.id;
        self.inner.stream.send_replace(Some(pending.clone()));
        *slot = Some(Slot {
            pending,
            responder,
        });
        drop(slot);

        self.inner.telemetry.record(
            LogLevel::Info,
            topics::CONFIRMATION_REQUESTED,
            None,
            json!({
                "confirmation_id": id,
                "action_id": action.id,
                "kind": action.kind.label(),
            }),
        );
        Ok(ConfirmationTicket {
            id,
            gate: Arc::clone(&self.inner),
            receiver: Some(receiver),
        })
    }

    /// Approves the pending confirmation `id`.
    pub fn resolve(&self, id: Uuid) -> Result<(), OperationError> {
        self.answer(id, Decision::Approved)
    }

    /// Rejects the pending confirmation `id`.
    pub fn reject(&self, id: Uuid) -> Result<(), OperationError> {
        self.answer(id, Decision::Rejected)
    }

    /// The confirmation currently open, if any.
    #[must_use]
    pub fn pending(&self) -> Option<PendingConfirmation> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(|held| held.pending.clone())
    }

    /// Observes the slot; `None` means nothing is waiting.
    #[must_use]
    pub fn stream(&self) -> watch::Receiver<Option<PendingConfirmation>> {
        self.inner.stream.subscribe()
    }

    fn answer(&self, id: Uuid, decision: Decision) -> Result<(), OperationError> {
        let slot = self
            .inner
            .take_if(id)
            .ok_or(OperationError::NoPendingConfirmation)?;
        let action_id = slot.pending.action.id;
        if slot.responder.send(decision).is_err() {
            tracing::debug!(confirmation = %id, "submitter left before the answer");
        }
        self.inner.telemetry.record(
            LogLevel::Info,
            topics::CONFIRMATION_ANSWERED,
            None,
            json!({
                "confirmation_id": id,
                "action_id": action_id,
                "decision": decision.label(),
            }),
        );
        Ok(())
    }
}

fn prompt(action: &Action) -> String {
    let target = action.target.identity.as_deref().map_or_else(
        || action.target.resource_type.label().to_string(),
        |identity| format!("{} `{identity}`", action.target.resource_type),
    );
    format!(
        "{} on {target} cannot be undone automatically. Proceed?",
        action.kind
    )
}

/// Held by the submitter while its confirmation is open.
///
/// Dropping an unanswered ticket clears the slot.
pub struct ConfirmationTicket {
    id: Uuid,
    gate: Arc<GateInner>,
    receiver: Option<oneshot::Receiver<Decision>>,
}

impl fmt::Debug for ConfirmationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationTicket")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConfirmationTicket {
    /// Confirmation id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the answer. A gate torn down without answering counts as rejected.
    pub async fn decision(mut self) -> Decision {
        match self.receiver.take() {
            Some(receiver) => receiver.await.unwrap_or(Decision::Rejected),
            None => Decision::Rejected,
        }
    }
}

impl Drop for ConfirmationTicket {
    fn drop(&mut self) {
        if self.gate.take_if(self.id).is_some() {
            tracing::debug!(confirmation = %self.id, "confirmation abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionKind, ResourceRef, ResourceType};

    fn disable_firewall() -> Action {
        Action::builder(
            ActionKind::FirewallDisable,
            ResourceRef::collection(ResourceType::FirewallStatus),
        )
        .build()
    }

    #[tokio::test]
    async fn single_slot_until_answered() {
        let gate = ConfirmationGate::new(OperationsTelemetry::disabled());
        let ticket = gate.request(&disable_firewall()).unwrap();
        assert!(matches!(
            gate.request(&disable_firewall()),
            Err(OperationError::ConfirmationPending)
        ));
        assert_eq!(gate.pending().unwrap().id, ticket.id());

        gate.resolve(ticket.id()).unwrap();
        assert_eq!(ticket.decision().await, Decision::Approved);
        assert!(gate.pending().is_none());

        let next = gate.request(&disable_firewall()).unwrap();
        gate.reject(next.id()).unwrap();
        assert_eq!(next.decision().await, Decision::Rejected);
    }

    #[test]
    fn answering_unknown_ids_fails() {
        let gate = ConfirmationGate::new(OperationsTelemetry::disabled());
        assert!(matches!(
            gate.resolve(Uuid::new_v4()),
            Err(OperationError::NoPendingConfirmation)
        ));
        let ticket = gate.request(&disable_firewall()).unwrap();
        assert!(matches!(
            gate.reject(Uuid::new_v4()),
            Err(OperationError::NoPendingConfirmation)
        ));
        assert!(gate.pending().is_some());
        gate.reject(ticket.id()).unwrap();
        assert!(matches!(
            gate.reject(ticket.id()),
            Err(OperationError::NoPendingConfirmation)
        ));
    }

    #[test]
    fn stream_tracks_the_slot_and_dropped_tickets_clear_it() {
        let gate = ConfirmationGate::new(OperationsTelemetry::disabled());
        let stream = gate.stream();
        assert!(stream.borrow().is_none());

        let ticket = gate.request(&disable_firewall()).unwrap();
        let shown = stream.borrow().clone().unwrap();
        assert_eq!(shown.id, ticket.id());
        assert!(shown.prompt.starts_with("firewall.disable on firewall_status"));

        drop(ticket);
        assert!(stream.borrow().is_none());
        assert!(gate.pending().is_none());
        assert!(gate.request(&disable_firewall()).is_ok());
    }
}
