//! AMQP (RabbitMQ) broker implementation.
//!
//! Requests and replies go through the default exchange, addressed by queue
//! name. Request queues are durable; reply queues are server-named and
//! auto-delete once their consumer goes away.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Acker, AmqpBusConfig, Broker, BusError, Delivery, DeliveryStream, OutboundMessage, Result,
};

/// Default exchange: routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

/// Configuration for AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Unacked deliveries per consumer.
    pub prefetch: u16,
    /// Server-side expiry of a reply queue nobody consumes.
    pub reply_queue_ttl: Duration,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
            prefetch: 1,
            reply_queue_ttl: Duration::from_secs(120),
        }
    }
}

impl From<&AmqpBusConfig> for AmqpConfig {
    fn from(config: &AmqpBusConfig) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            prefetch: config.prefetch.max(1),
            ..Self::new(config.url.clone())
        }
    }
}

/// RabbitMQ broker.
///
/// Declares, publishes and deletes go through one shared channel guarded by
/// a mutex (single writer). Each consumer gets its own channel, so closing a
/// consumer returns its unacked deliveries to the queue.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpConfig,
    command_channel: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    /// Connect to RabbitMQ.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let broker = Self {
            pool,
            config,
            command_channel: Mutex::new(None),
        };

        // Verify connection
        broker.new_channel().await?;

        info!(url = %broker.config.url, "Connected to AMQP");
        Ok(broker)
    }

    /// Open a fresh channel on a pooled connection.
    async fn new_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// The shared command channel, reopened if it was closed.
    async fn command_channel(&self) -> Result<tokio::sync::MutexGuard<'_, Option<Channel>>> {
        let mut guard = self.command_channel.lock().await;
        let usable = guard
            .as_ref()
            .map(|c| c.status().connected())
            .unwrap_or(false);
        if !usable {
            *guard = Some(self.new_channel().await?);
        }
        Ok(guard)
    }

    fn reply_queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        let ttl_ms = u32::try_from(self.config.reply_queue_ttl.as_millis()).unwrap_or(u32::MAX);
        arguments.insert("x-expires".into(), AMQPValue::LongUInt(ttl_ms));
        arguments
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let guard = self.command_channel().await?;
        let channel = guard
            .as_ref()
            .ok_or_else(|| BusError::Connection("No command channel".to_string()))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare queue '{}': {}", queue, e)))?;

        debug!(queue = %queue, "Declared queue");
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let guard = self.command_channel().await?;
        let channel = guard
            .as_ref()
            .ok_or_else(|| BusError::Connection("No command channel".to_string()))?;

        // Not exclusive: the consumer may sit on another pooled connection.
        let declared = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: true,
                    ..Default::default()
                },
                self.reply_queue_arguments(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare reply queue: {}", e)))?;

        let name = declared.name().as_str().to_string();
        debug!(queue = %name, "Declared reply queue");
        Ok(name)
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        let guard = self.command_channel().await?;
        let channel = guard
            .as_ref()
            .ok_or_else(|| BusError::Connection("No command channel".to_string()))?;

        let confirm = channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(queue = %queue, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self.new_channel().await?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("realty-{}", uuid::Uuid::new_v4().simple()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        debug!(queue = %queue, "Consumer started");

        let guard = ChannelGuard {
            channel,
            queue: queue.to_string(),
        };

        // The guard rides along with the consumer and closes the channel on drop.
        let stream = futures::stream::unfold((consumer, guard), |(mut consumer, guard)| async move {
            let delivery = consumer
                .next()
                .await?
                .map(into_delivery)
                .map_err(|e| BusError::Subscribe(format!("Consumer error: {}", e)));
            Some((delivery, (consumer, guard)))
        });

        Ok(stream.boxed())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let guard = self.command_channel().await?;
        let channel = guard
            .as_ref()
            .ok_or_else(|| BusError::Connection("No command channel".to_string()))?;

        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| BusError::Delete(format!("Failed to delete queue '{}': {}", queue, e)))?;

        debug!(queue = %queue, "Deleted queue");
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|s| s.as_str().to_string());
    let reply_to = properties
        .reply_to()
        .as_ref()
        .map(|s| s.as_str().to_string());

    Delivery::new(
        delivery.data,
        correlation_id,
        reply_to,
        delivery.redelivered,
        Box::new(LapinAcker(delivery.acker)),
    )
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(format!("Failed to ack: {}", e)))
    }
}

/// Closes a consumer's channel when its stream is dropped.
struct ChannelGuard {
    channel: Channel,
    queue: String,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = self.channel.clone();
        let queue = std::mem::take(&mut self.queue);
        handle.spawn(async move {
            if let Err(e) = channel.close(200, "consumer dropped").await {
                warn!(queue = %queue, error = %e, "Failed to close consumer channel");
            }
        });
    }
}
