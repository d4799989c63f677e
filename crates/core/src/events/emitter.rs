//! Event emitter for publishing and fanning out events

use crate::events::subscriber::{EventEnvelope, EventSubscriber};
use crate::events::SystemEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Event emitter for publishing events
///
/// Emitting never blocks and never fails: with no receivers the event is
/// dropped, and slow receivers observe a lag instead of stalling publishers.
#[derive(Debug)]
pub struct EventEmitter {
    sender: broadcast::Sender<EventEnvelope>,
    next_sequence: AtomicU64,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventEmitter {
    /// Create a new event emitter with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Emit an event to all current receivers
    pub fn emit(&self, event: impl Into<SystemEvent>) {
        let envelope = EventEnvelope {
            event: event.into(),
            timestamp: SystemTime::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };

        // Err only means there are no receivers right now
        let _ = self.sender.send(envelope);
    }

    /// Create a receiver for custom handling
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Number of live receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Drive a subscriber from this emitter on a background task.
    ///
    /// The task ends when the emitter is dropped.
    pub fn spawn_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        debug!(subscriber = subscriber.name(), "Event subscriber added");

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if !subscriber.is_interested(&envelope.event) {
                            continue;
                        }
                        if let Err(e) = subscriber.handle_event(&envelope).await {
                            error!(
                                subscriber = subscriber.name(),
                                error = %e,
                                "Event subscriber failed to handle event"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            subscriber = subscriber.name(),
                            skipped, "Event subscriber lagged behind"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(subscriber = subscriber.name(), "Event subscriber stopped");
        })
    }
}
