//! Convergence-based completion: an operation without a host job id is
//! considered done once a reference value moves away from its pre-action
//! baseline, or once the host says nothing is pending any more.
//!
//! This is a heuristic. The poll loop bounds it with
//! `convergence.max_wait_secs` and reports an ambiguous outcome past that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{actions::ResourceType, config::ConvergenceSettings};

/// What to probe and how to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceProbe {
    /// Resource fetched on every tick.
    pub resource_type: ResourceType,
    /// JSON pointer to the reference value.
    pub reference_pointer: String,
    /// JSON pointer to a "still pending" boolean, if the host reports one.
    pub pending_pointer: Option<String>,
}

/// Reference value captured before the action was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Value at the reference pointer, if present.
    pub reference: Option<Value>,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

/// Why a probe declared completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceReason {
    /// The reference value differs from the baseline.
    ReferenceChanged,
    /// The host reports nothing further is pending.
    NothingPending,
}

/// Result of evaluating one probe payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvergenceVerdict {
    /// Keep probing.
    Pending,
    /// The operation is considered complete.
    Converged {
        /// Trigger.
        reason: ConvergenceReason,
        /// Reference value observed on the converging probe.
        reference: Option<Value>,
    },
}

impl ConvergenceProbe {
    /// Builds a probe for `resource_type` using the configured pointers.
    #[must_use]
    pub fn new(resource_type: ResourceType, settings: &ConvergenceSettings) -> Self {
        Self {
            resource_type,
            reference_pointer: settings.reference_pointer.clone(),
            pending_pointer: settings.pending_pointer.clone(),
        }
    }

    /// Captures the baseline from a pre-action payload.
    #[must_use]
    pub fn baseline(&self, payload: &Value) -> Baseline {
        Baseline {
            reference: self.reference(payload),
            captured_at: Utc::now(),
        }
    }

    /// Compares a probe payload against the baseline.
    #[must_use]
    pub fn evaluate(&self, baseline: &Baseline, payload: &Value) -> ConvergenceVerdict {
        let reference = self.reference(payload);
        if reference.is_some() && reference != baseline.reference {
            return ConvergenceVerdict::Converged {
                reason: ConvergenceReason::ReferenceChanged,
                reference,
            };
        }
        let nothing_pending = self
            .pending_pointer
            .as_deref()
            .and_then(|pointer| payload.pointer(pointer))
            .and_then(Value::as_bool)
            == Some(false);
        if nothing_pending {
            return ConvergenceVerdict::Converged {
                reason: ConvergenceReason::NothingPending,
                reference,
            };
        }
        ConvergenceVerdict::Pending
    }

    fn reference(&self, payload: &Value) -> Option<Value> {
        payload
            .pointer(&self.reference_pointer)
            .filter(|value| !value.is_null())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe() -> ConvergenceProbe {
        ConvergenceProbe::new(ResourceType::SystemVersion, &ConvergenceSettings::default())
    }

    #[test]
    fn unchanged_reference_keeps_pending() {
        let probe = probe();
        let baseline = probe.baseline(&json!({ "current_commit": "abc123", "update_available": true }));
        assert_eq!(baseline.reference, Some(json!("abc123")));
        assert_eq!(
            probe.evaluate(
                &baseline,
                &json!({ "current_commit": "abc123", "update_available": true })
            ),
            ConvergenceVerdict::Pending
        );
        assert_eq!(
            probe.evaluate(&baseline, &json!({ "current_commit": "abc123" })),
            ConvergenceVerdict::Pending
        );
    }

    #[test]
    fn changed_reference_converges() {
        let probe = probe();
        let baseline = probe.baseline(&json!({ "current_commit": "abc123" }));
        assert_eq!(
            probe.evaluate(&baseline, &json!({ "current_commit": "def456" })),
            ConvergenceVerdict::Converged {
                reason: ConvergenceReason::ReferenceChanged,
                reference: Some(json!("def456")),
            }
        );
    }

    #[test]
    fn nothing_pending_converges_without_reference_change() {
        let probe = probe();
        let baseline = probe.baseline(&json!({ "current_commit": "abc123", "update_available": true }));
        assert!(matches!(
            probe.evaluate(
                &baseline,
                &json!({ "current_commit": "abc123", "update_available": false })
            ),
            ConvergenceVerdict::Converged {
                reason: ConvergenceReason::NothingPending,
                ..
            }
        ));
    }

    #[test]
    fn missing_reference_in_probe_is_not_a_change() {
        let probe = probe();
        let baseline = probe.baseline(&json!({ "current_commit": "abc123" }));
        assert_eq!(
            probe.evaluate(&baseline, &json!({ "current_commit": null })),
            ConvergenceVerdict::Pending
        );
        let blind = probe.baseline(&json!({}));
        assert!(matches!(
            probe.evaluate(&blind, &json!({ "current_commit": "abc123" })),
            ConvergenceVerdict::Converged { .. }
        ));
    }
}
