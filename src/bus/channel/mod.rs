//! In-memory channel-based message bus for standalone mode.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Work and notification topics behave the same here: every subscriber of a
//! topic sees every message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::{dispatch_to_handlers, Envelope, MessageBus, MessageHandler, Result, Topic};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

type HandlerMap = HashMap<Topic, Vec<Arc<dyn MessageHandler>>>;

/// In-memory message bus using a tokio broadcast channel.
pub struct ChannelMessageBus {
    sender: broadcast::Sender<Arc<Envelope>>,
    handlers: Arc<RwLock<HandlerMap>>,
    consuming: Arc<RwLock<bool>>,
}

impl Default for ChannelMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMessageBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        info!(capacity = CHANNEL_CAPACITY, "Channel message bus initialized");
        Self {
            sender,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            consuming: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the consumer task once.
    async fn start_consuming(&self) {
        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return;
            }
            *consuming = true;
        }

        let mut receiver = self.sender.subscribe();
        let handlers = self.handlers.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        let topic = match envelope.topic() {
                            Ok(topic) => topic,
                            Err(e) => {
                                warn!(error = %e, "Dropping message");
                                continue;
                            }
                        };
                        let targets: Vec<Arc<dyn MessageHandler>> = handlers
                            .read()
                            .await
                            .get(&topic)
                            .cloned()
                            .unwrap_or_default();
                        if targets.is_empty() {
                            continue;
                        }
                        debug!(topic = %topic, handlers = targets.len(), "Received message via channel");
                        dispatch_to_handlers(&targets, &envelope).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                }
            }
        });

        info!("Channel consumer started");
    }
}

#[async_trait]
impl MessageBus for ChannelMessageBus {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let topic = envelope.topic()?;
        match self.sender.send(Arc::new(envelope)) {
            Ok(receivers) => debug!(topic = %topic, receivers, "Published message to channel"),
            Err(_) => debug!(topic = %topic, "Published message (no receivers)"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, handler: Box<dyn MessageHandler>) -> Result<()> {
        let count = {
            let mut handlers = self.handlers.write().await;
            let entry = handlers.entry(topic).or_default();
            entry.push(Arc::from(handler));
            entry.len()
        };
        info!(topic = %topic, handler_count = count, "Handler subscribed to channel bus");
        self.start_consuming().await;
        Ok(())
    }
}
