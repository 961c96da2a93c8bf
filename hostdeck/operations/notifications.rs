use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hostdeck_event_bus::topics;
use hostdeck_logging::LogLevel;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{actions::ActionId, telemetry::OperationsTelemetry};

/// Severity of a feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Operation succeeded.
    Success,
    /// Neutral information.
    Info,
    /// Attention needed, outcome unclear.
    Warning,
    /// Operation failed.
    Error,
}

impl Severity {
    const fn log_level(self) -> LogLevel {
        match self {
            Self::Success | Self::Info => LogLevel::Info,
            Self::Warning => LogLevel::Warn,
            Self::Error => LogLevel::Error,
        }
    }
}

/// One ephemeral entry in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Identifier used by `dismiss`.
    pub id: Uuid,
    /// Severity.
    pub severity: Severity,
    /// Display text.
    pub text: String,
    /// Action the entry reports on, if any.
    pub action_id: Option<ActionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Entry disappears from reads after this instant.
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    /// Whether the entry is still visible at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Append-only feed where every entry expires on its own.
///
/// Expired entries are dropped lazily on the next read or write.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

struct CenterInner {
    entries: RwLock<VecDeque<Notification>>,
    ttl: Duration,
    telemetry: OperationsTelemetry,
}

impl fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationCenter")
            .field("entries", &self.inner.entries.read().len())
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}

impl NotificationCenter {
    /// Creates a feed whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, telemetry: OperationsTelemetry) -> Self {
        Self {
            inner: Arc::new(CenterInner {
                entries: RwLock::new(VecDeque::new()),
                ttl,
                telemetry,
            }),
        }
    }

    /// Appends an entry, leaving every other entry alone.
    pub fn push(
        &self,
        severity: Severity,
        text: impl Into<String>,
        action_id: Option<ActionId>,
    ) -> Notification {
        self.append(severity, text.into(), action_id, false)
    }

    /// Appends an entry after clearing earlier entries for the same action.
    pub fn push_replacing(
        &self,
        severity: Severity,
        text: impl Into<String>,
        action_id: ActionId,
    ) -> Notification {
        self.append(severity, text.into(), Some(action_id), true)
    }

    /// Removes an entry. Returns whether it was present.
    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Live entries, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<Notification> {
        self.active_at(Utc::now())
    }

    /// Live entries as of `now`, oldest first.
    #[must_use]
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut entries = self.inner.entries.write();
        entries.retain(|entry| entry.is_live_at(now));
        entries.iter().cloned().collect()
    }

    /// Live entries reporting on `action_id`.
    #[must_use]
    pub fn for_action(&self, action_id: ActionId) -> Vec<Notification> {
        self.active()
            .into_iter()
            .filter(|entry| entry.action_id == Some(action_id))
            .collect()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }

    fn append(
        &self,
        severity: Severity,
        text: String,
        action_id: Option<ActionId>,
        replace: bool,
    ) -> Notification {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.inner.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let entry = Notification {
            id: Uuid::new_v4(),
            severity,
            text,
            action_id,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let replaced = {
            let mut entries = self.inner.entries.write();
            entries.retain(|existing| existing.is_live_at(now));
            let before = entries.len();
            if replace {
                entries.retain(|existing| existing.action_id != action_id);
            }
            let replaced = before - entries.len();
            entries.push_back(entry.clone());
            replaced
        };
        self.inner.telemetry.record(
            severity.log_level(),
            topics::NOTIFICATION_POSTED,
            None,
            json!({
                "notification_id": entry.id,
                "severity": severity,
                "text": entry.text,
                "action_id": action_id,
                "replaced": replaced,
            }),
        );
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center() -> NotificationCenter {
        NotificationCenter::new(Duration::from_secs(5), OperationsTelemetry::disabled())
    }

    #[test]
    fn entries_expire_independently() {
        let center = center();
        let first = center.push(Severity::Info, "index refreshed", None);
        let later = Utc::now() + chrono::Duration::seconds(3);
        assert_eq!(center.active_at(later).len(), 1);
        assert_eq!(center.active_at(first.expires_at).len(), 0);
        assert!(center.active().is_empty());
    }

    #[test]
    fn new_entries_keep_unrelated_ones() {
        let center = center();
        let a = ActionId::new_v4();
        let b = ActionId::new_v4();
        center.push(Severity::Success, "nginx restarted", Some(a));
        center.push(Severity::Success, "php 8.3 installed", Some(b));
        center.push(Severity::Info, "cache cleaned", None);
        assert_eq!(center.active().len(), 3);

        let error = center.push_replacing(Severity::Error, "nginx failed to start", a);
        let active = center.active();
        assert_eq!(active.len(), 3);
        assert_eq!(center.for_action(a), vec![error]);
        assert_eq!(center.for_action(b).len(), 1);
    }

    #[test]
    fn dismiss_removes_one_entry() {
        let center = center();
        let keep = center.push(Severity::Warning, "outcome unknown", None);
        let gone = center.push(Severity::Info, "done", None);
        assert!(center.dismiss(gone.id));
        assert!(!center.dismiss(gone.id));
        assert_eq!(center.active(), vec![keep]);
        center.clear();
        assert!(center.active().is_empty());
    }
}
