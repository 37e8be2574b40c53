//! Message broker abstraction.
//!
//! This module contains:
//! - `Broker` trait: the queue operations the RPC core consumes
//! - `Delivery`: an inbound message with its properties and ack handle
//! - Bus configuration types and the broker factory
//! - Implementations: AMQP (RabbitMQ), in-memory channel

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::info;

use crate::topic::Topic;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(any(test, feature = "channel"))]
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
#[cfg(any(test, feature = "channel"))]
pub use channel::ChannelBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Queue declare failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Queue delete failed: {0}")]
    Delete(String),
}

/// Properties of an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// UTF-8 JSON body.
    pub body: Vec<u8>,
    /// Correlation id echoed by the responder.
    pub correlation_id: Option<String>,
    /// Queue the responder should publish its answer to.
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// An inbound message.
///
/// Acknowledging consumes the delivery, so a delivery is acked at most once.
pub struct Delivery {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Set when the broker has handed this message out before.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            correlation_id,
            reply_to,
            redelivered,
            acker,
        }
    }

    /// Reply address, present only when both `reply_to` and `correlation_id`
    /// are set and non-empty.
    pub fn reply_address(&self) -> Option<(&str, &str)> {
        match (self.reply_to.as_deref(), self.correlation_id.as_deref()) {
            (Some(reply_to), Some(correlation_id))
                if !reply_to.is_empty() && !correlation_id.is_empty() =>
            {
                Some((reply_to, correlation_id))
            }
            _ => None,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries from one queue.
///
/// Dropping the stream cancels the consumer; deliveries that were not acked
/// go back to the queue.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Queue operations used by the RPC client and the worker dispatcher.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-memory, for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable, shared queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Declare a transient, auto-deleting queue with a broker-assigned
    /// name, and return that name.
    async fn declare_reply_queue(&self) -> Result<String>;

    /// Publish a message to a queue by name.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Delete a queue.
    async fn delete_queue(&self, queue: &str) -> Result<()>;
}

/// Declare the request queue of every topic.
pub async fn declare_topology(broker: &dyn Broker) -> Result<()> {
    for topic in Topic::ALL {
        broker.declare_queue(topic.queue()).await?;
        info!(topic = %topic, queue = topic.queue(), "Request queue declared");
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-memory broker shared within one process.
    #[default]
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

impl std::str::FromStr for MessagingType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "channel" => Ok(Self::Channel),
            "amqp" => Ok(Self::Amqp),
            other => Err(format!("unknown messaging type '{}'", other)),
        }
    }
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Unacked deliveries a dispatcher may hold at once.
    pub prefetch: u16,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
            prefetch: 1,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - AMQP: `--features amqp`
pub async fn init_broker(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(any(test, feature = "channel"))]
            {
                info!(messaging_type = "channel", "Broker initialized");
                Ok(Arc::new(ChannelBroker::new()))
            }

            #[cfg(not(any(test, feature = "channel")))]
            {
                Err("Channel broker requires the 'channel' feature. Rebuild with --features channel".into())
            }
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::new(AmqpConfig::from(&config.amqp)).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}
