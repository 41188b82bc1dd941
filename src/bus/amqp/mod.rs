//! AMQP (RabbitMQ) message bus implementation.
//!
//! Work topics are published to a durable topic exchange and consumed from
//! one durable queue per stage (`{queue_prefix}.{schema}`), so each message
//! is handled by one worker. Notification topics go to a fan-out exchange;
//! every subscriber binds its own exclusive queue and sees every message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{
    dispatch_to_handlers, BusError, Envelope, MessageBus, MessageHandler, Result, Topic,
};
use crate::config::AmqpConfig;

type HandlerMap = HashMap<Topic, Vec<Arc<dyn MessageHandler>>>;

/// AMQP message bus using RabbitMQ.
pub struct AmqpMessageBus {
    pool: Pool,
    config: AmqpConfig,
    handlers: Arc<RwLock<HandlerMap>>,
}

impl AmqpMessageBus {
    /// Connect and declare both exchanges.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        for (exchange, kind) in [
            (&config.exchange, ExchangeKind::Topic),
            (&config.notify_exchange, ExchangeKind::Fanout),
        ] {
            channel
                .exchange_declare(
                    exchange,
                    kind,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BusError::Connection(format!("Failed to declare exchange {}: {}", exchange, e))
                })?;
        }

        info!(
            exchange = %config.exchange,
            notify_exchange = %config.notify_exchange,
            url = %config.url,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    fn exchange_for(&self, topic: Topic) -> &str {
        if topic.is_notification() {
            &self.config.notify_exchange
        } else {
            &self.config.exchange
        }
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(
        pool: Pool,
        config: AmqpConfig,
        topic: Topic,
        handlers: Arc<RwLock<HandlerMap>>,
    ) {
        use futures::StreamExt;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match Self::setup_consumer(&pool, &config, topic).await {
                Ok(mut consumer) => {
                    info!(topic = %topic, "Consumer connected, processing messages");
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                Self::process_delivery(delivery, topic, &handlers).await;
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(topic = %topic, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        topic = %topic,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Declare and bind the queue for `topic`, then start consuming it.
    async fn setup_consumer(
        pool: &Pool,
        config: &AmqpConfig,
        topic: Topic,
    ) -> Result<lapin::Consumer> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        // One unacknowledged message at a time per consumer.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let (queue_name, exchange, routing_key, options) = if topic.is_notification() {
            (
                String::new(),
                config.notify_exchange.as_str(),
                String::new(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            )
        } else {
            (
                format!("{}.{}", config.queue_prefix, topic.schema()),
                config.exchange.as_str(),
                topic.routing_key(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            )
        };

        let queue = channel
            .queue_declare(&queue_name, options, FieldTable::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue_name,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );

        channel
            .basic_consume(
                &queue_name,
                "osmtracker-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Process one delivery. Acknowledged only after every handler succeeded.
    async fn process_delivery(
        delivery: lapin::message::Delivery,
        topic: Topic,
        handlers: &Arc<RwLock<HandlerMap>>,
    ) {
        let envelope = match Envelope::from_bytes(&delivery.data).and_then(|env| {
            env.topic()?;
            Ok(env)
        }) {
            Ok(envelope) => Arc::new(envelope),
            Err(e) => {
                error!(error = %e, routing_key = %delivery.routing_key, "Failed to decode message");
                // Malformed messages are never going to succeed.
                if let Err(e) = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    error!(error = %e, "Failed to reject message");
                }
                return;
            }
        };

        debug!(routing_key = %delivery.routing_key, schema = %envelope.schema, "Received message");

        let targets: Vec<Arc<dyn MessageHandler>> = handlers
            .read()
            .await
            .get(&topic)
            .cloned()
            .unwrap_or_default();

        if dispatch_to_handlers(&targets, &envelope).await {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "Failed to ack message");
            }
        } else if let Err(e) = delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
        {
            error!(error = %e, "Failed to nack message");
        }
    }
}

#[async_trait]
impl MessageBus for AmqpMessageBus {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        let topic = envelope.topic()?;
        let exchange = self.exchange_for(topic).to_string();
        let routing_key = topic.routing_key();
        let payload = envelope.to_bytes()?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let channel = match self.get_channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2);

            match channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            max_retries = MAX_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(BusError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(BusError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }

    async fn subscribe(&self, topic: Topic, handler: Box<dyn MessageHandler>) -> Result<()> {
        let first = {
            let mut handlers = self.handlers.write().await;
            let entry = handlers.entry(topic).or_default();
            entry.push(Arc::from(handler));
            entry.len() == 1
        };

        if first {
            let pool = self.pool.clone();
            let config = self.config.clone();
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                Self::consume_with_reconnect(pool, config, topic, handlers).await;
            });
        }

        Ok(())
    }
}
