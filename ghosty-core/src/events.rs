//! Progress and diagnostic event stream
//!
//! The core pushes plain-text progress lines into an [`EventBus`]; front ends
//! subscribe and render them. Every event is mirrored to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    /// Progress
    Info,
    /// A problem that did not stop the operation
    Warning,
    /// A failed operation
    Error,
}

/// Component an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    /// Hardware address changes
    Identity,
    /// Tunnel client
    Tunnel,
    /// Anonymity service
    Anonymity,
    /// Circuit rotation tool and control port
    Rotation,
    /// Activation and teardown sequencing
    Orchestrator,
    /// Host sampling
    Monitor,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Identity => "identity",
            Component::Tunnel => "tunnel",
            Component::Anonymity => "anonymity",
            Component::Rotation => "rotation",
            Component::Orchestrator => "orchestrator",
            Component::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

/// A single human-readable progress line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event was emitted
    pub at: DateTime<Utc>,
    /// Severity
    pub level: EventLevel,
    /// Originating component
    pub component: Component,
    /// Plain-text message
    pub message: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        };
        write!(
            f,
            "[{}] [{}] {}: {}",
            self.at.format("%H:%M:%S"),
            level,
            self.component,
            self.message
        )
    }
}

/// Broadcast sink for [`Event`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default backlog
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus that buffers up to `capacity` events per lagging subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, level: EventLevel, component: Component, message: impl Into<String>) {
        let message = message.into();
        match level {
            EventLevel::Info => tracing::info!(%component, "{}", message),
            EventLevel::Warning => tracing::warn!(%component, "{}", message),
            EventLevel::Error => tracing::error!(%component, "{}", message),
        }

        // No subscribers is fine.
        let _ = self.sender.send(Event {
            at: Utc::now(),
            level,
            component,
            message,
        });
    }

    /// Emit an informational event
    pub fn info(&self, component: Component, message: impl Into<String>) {
        self.emit(EventLevel::Info, component, message);
    }

    /// Emit a warning
    pub fn warn(&self, component: Component, message: impl Into<String>) {
        self.emit(EventLevel::Warning, component, message);
    }

    /// Emit an error event
    pub fn error(&self, component: Component, message: impl Into<String>) {
        self.emit(EventLevel::Error, component, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.info(Component::Identity, "changing address");
        bus.warn(Component::Tunnel, "disconnect warning");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, EventLevel::Info);
        assert_eq!(first.component, Component::Identity);
        assert_eq!(first.message, "changing address");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.level, EventLevel::Warning);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.error(Component::Rotation, "nobody is listening");
    }

    #[test]
    fn test_display_is_plain_text() {
        let event = Event {
            at: Utc::now(),
            level: EventLevel::Error,
            component: Component::Rotation,
            message: "tornet ended with error".to_string(),
        };
        let rendered = event.to_string();
        assert!(rendered.contains("[ERROR] rotation: tornet ended with error"));
    }
}
