//! Messaging configuration types.

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broadcast channel (no external broker).
    #[default]
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            amqp: AmqpConfig::default(),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Topic exchange carrying per-stage work messages.
    pub exchange: String,
    /// Fan-out exchange carrying generation and pointer notifications.
    pub notify_exchange: String,
    /// Prefix of the per-stage durable queue names.
    pub queue_prefix: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "osmtracker".to_string(),
            notify_exchange: "osmtracker.notify".to_string(),
            queue_prefix: "osmtracker".to_string(),
        }
    }
}
