//! Security events published for an external audit pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::detection::AttackPattern;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// A discrete event the engine reports but does not persist.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    AttackPatternDetected {
        identifier: String,
        pattern: AttackPattern,
    },
    IdentifierBlocked {
        identifier: String,
        reason: String,
        retry_after_secs: u64,
        at: DateTime<Utc>,
    },
    BackendDegraded {
        backend: String,
        error: String,
    },
    BackendRecovered {
        backend: String,
    },
}

/// Fan-out publisher for [`SecurityEvent`]s.
///
/// Publishing never blocks and never fails: events sent while nobody is
/// subscribed are only logged.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SecurityEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SecurityEvent) {
        match &event {
            SecurityEvent::AttackPatternDetected { identifier, pattern } => warn!(
                identifier = %identifier,
                attack_type = %pattern.attack_type,
                confidence = pattern.confidence,
                severity = pattern.severity,
                "Attack pattern detected"
            ),
            SecurityEvent::IdentifierBlocked {
                identifier,
                reason,
                retry_after_secs,
                ..
            } => warn!(
                identifier = %identifier,
                reason = %reason,
                retry_after_secs = retry_after_secs,
                "Identifier blocked"
            ),
            SecurityEvent::BackendDegraded { backend, error } => warn!(
                backend = %backend,
                error = %error,
                "Counter backend degraded, using local fallback"
            ),
            SecurityEvent::BackendRecovered { backend } => {
                info!(backend = %backend, "Counter backend recovered")
            }
        }

        // Err only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SecurityEvent::BackendRecovered {
            backend: "mesh".to_string(),
        });

        match rx.recv().await.unwrap() {
            SecurityEvent::BackendRecovered { backend } => assert_eq!(backend, "mesh"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(SecurityEvent::BackendDegraded {
            backend: "mesh".to_string(),
            error: "timeout".to_string(),
        });
    }

    #[test]
    fn test_event_json_tag() {
        let event = SecurityEvent::BackendDegraded {
            backend: "mesh".to_string(),
            error: "down".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "backend_degraded");
        assert_eq!(json["backend"], "mesh");
    }
}
