use super::types::LifecycleEvent;
use crate::config::EventsConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Error types for event delivery
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Event handler '{handler}' cannot process {event}")]
    UnexpectedEvent { handler: String, event: String },
}

/// Destination the engine publishes lifecycle events to
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventError>;
}

/// Synchronous consumer registered on an [`EventPublisher`]
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &LifecycleEvent) -> Result<(), EventError>;
}

/// Fans events out to registered handlers and a broadcast channel
pub struct EventPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    enabled: bool,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(Vec::new()),
            enabled: true,
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.channel_capacity)
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "Registering event handler");
        self.handlers.write().push(handler);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::from_config(&EventsConfig::default())
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    /// Every handler sees the event even if an earlier one fails; the first failure
    /// is returned.
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventError> {
        if !self.enabled {
            return Ok(());
        }

        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().clone();
        let mut first_error = None;
        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                warn!(
                    handler = handler.name(),
                    event = event.name(),
                    "Event handler failed: {}",
                    err
                );
                first_error.get_or_insert(err);
            }
        }

        // No subscribers is fine
        let _ = self.sender.send(event);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
