//! Event subscriber traits and event envelopes

use crate::events::SystemEvent;
use std::time::SystemTime;

/// Event with bus metadata
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// The actual event
    pub event: SystemEvent,
    /// Timestamp when the event was emitted
    pub timestamp: SystemTime,
    /// Monotonic sequence number assigned by the emitter
    pub sequence: u64,
}

/// Trait for event subscribers
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Handle an event
    async fn handle_event(
        &self,
        event: &EventEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Subscriber name for debugging
    fn name(&self) -> &'static str;

    /// Check if subscriber is interested in this event type
    fn is_interested(&self, _event: &SystemEvent) -> bool {
        true
    }
}
