//! Message bus for distributing work and change notifications.
//!
//! This module contains:
//! - `MessageBus` trait: topic publish/subscribe
//! - `MessageHandler` trait: for processing delivered envelopes
//! - `Envelope`: `{schema, version, message}` wire format
//! - Implementations: in-process broadcast channel, AMQP (RabbitMQ)
//!
//! Work topics (`new_cset`, `analysis_cset`, `refresh_cset`) go to one
//! durable queue per stage. Notification topics (`new_generation`,
//! `new_pointer`) are fanned out to every consumer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::{MessagingConfig, MessagingType};
use crate::model::{PointerPosition, Source};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

#[cfg(feature = "amqp")]
pub use amqp::AmqpMessageBus;
pub use channel::ChannelMessageBus;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Unknown schema {schema} version {version}")]
    UnknownSchema { schema: String, version: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Name of the application, used as routing key suffix.
pub const APP_NAME: &str = "osmtracker";

/// Current version of every message schema.
pub const SCHEMA_VERSION: u32 = 1;

/// Message topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A changeset was observed on the feed.
    NewCset,
    /// A changeset passed the pre-filter and awaits analysis.
    AnalysisCset,
    /// A changeset is due for a refresh.
    RefreshCset,
    /// The generation counter advanced.
    NewGeneration,
    /// The replication pointer advanced.
    NewPointer,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::NewCset,
        Topic::AnalysisCset,
        Topic::RefreshCset,
        Topic::NewGeneration,
        Topic::NewPointer,
    ];

    /// Schema name carried in the envelope.
    pub fn schema(&self) -> &'static str {
        match self {
            Topic::NewCset => "new_cset",
            Topic::AnalysisCset => "analysis_cset",
            Topic::RefreshCset => "refresh_cset",
            Topic::NewGeneration => "new_generation",
            Topic::NewPointer => "new_pointer",
        }
    }

    /// Routing key: `{schema}.osmtracker`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.schema(), APP_NAME)
    }

    /// Notifications are broadcast to all consumers instead of queued.
    pub fn is_notification(&self) -> bool {
        matches!(self, Topic::NewGeneration | Topic::NewPointer)
    }

    pub fn from_schema(schema: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.schema() == schema)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.schema())
    }
}

/// Wire format of every bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    pub version: u32,
    pub message: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(topic: Topic, message: &T) -> Result<Self> {
        Ok(Self {
            schema: topic.schema().to_string(),
            version: SCHEMA_VERSION,
            message: serde_json::to_value(message)?,
        })
    }

    /// Topic of a known schema at the supported version.
    pub fn topic(&self) -> Result<Topic> {
        match Topic::from_schema(&self.schema) {
            Some(topic) if self.version == SCHEMA_VERSION => Ok(topic),
            _ => Err(BusError::UnknownSchema {
                schema: self.schema.clone(),
                version: self.version,
            }),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.message.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload of changeset work topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsetMessage {
    pub cid: i64,
    #[serde(default)]
    pub source: Option<Source>,
}

/// Payload of `new_generation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMessage {
    pub generation: u64,
}

/// Payload of `new_pointer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerMessage {
    pub pointer: PointerPosition,
}

/// Handler for processing envelopes from the bus.
///
/// Returning an error leaves the message unacknowledged where the transport
/// supports redelivery.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<()>>;
}

/// Interface for message delivery.
///
/// Implementations:
/// - `ChannelMessageBus`: tokio broadcast channel, single process
/// - `AmqpMessageBus`: RabbitMQ topic and fan-out exchanges
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope. The topic is taken from its schema.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Register `handler` for `topic` and start consuming it.
    async fn subscribe(&self, topic: Topic, handler: Box<dyn MessageHandler>) -> Result<()>;
}

/// Publish a changeset work message.
pub async fn publish_cset(
    bus: &dyn MessageBus,
    topic: Topic,
    cid: i64,
    source: Option<Source>,
) -> Result<()> {
    bus.publish(Envelope::new(topic, &CsetMessage { cid, source })?)
        .await
}

/// Broadcast a new generation.
pub async fn notify_generation(bus: &dyn MessageBus, generation: u64) -> Result<()> {
    bus.publish(Envelope::new(
        Topic::NewGeneration,
        &GenerationMessage { generation },
    )?)
    .await
}

/// Broadcast a new replication pointer.
pub async fn notify_pointer(bus: &dyn MessageBus, pointer: &PointerPosition) -> Result<()> {
    bus.publish(Envelope::new(
        Topic::NewPointer,
        &PointerMessage {
            pointer: pointer.clone(),
        },
    )?)
    .await
}

/// Run every handler on one envelope, logging failures.
///
/// Returns false if any handler failed.
pub(crate) async fn dispatch_to_handlers(
    handlers: &[Arc<dyn MessageHandler>],
    envelope: &Arc<Envelope>,
) -> bool {
    let mut ok = true;
    for handler in handlers {
        if let Err(e) = handler.handle(Arc::clone(envelope)).await {
            error!(schema = %envelope.schema, error = %e, "Handler failed");
            ok = false;
        }
    }
    ok
}

/// Initialize the message bus based on configuration.
///
/// Requires the corresponding feature for broker-backed buses:
/// - AMQP: `--features amqp`
pub async fn init_bus(config: &MessagingConfig) -> Result<Arc<dyn MessageBus>> {
    match config.messaging_type {
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Message bus initialized");
            Ok(Arc::new(ChannelMessageBus::new()))
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let bus = AmqpMessageBus::new(config.amqp.clone()).await?;
                info!(messaging_type = "amqp", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
    }
}
