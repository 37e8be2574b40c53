//! Request/reply over the broker.
//!
//! `RpcClient::call` looks like a plain async function to HTTP handlers:
//!
//! ```text
//! call(action, payload)
//!   -> declare transient reply queue
//!   -> register correlation id with the ReplyRouter
//!   -> publish {action, payload} to the topic queue (reply_to, correlation_id)
//!   -> wait for the router to match the reply
//!   (all of the above bounded by one deadline taken at entry)
//!   -> delete the reply queue
//! ```
//!
//! Every failure comes back as a `ResponseEnvelope` with `status: "error"`.

mod router;

pub use router::{PendingCall, ReplyRouter, RouteOutcome};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{Broker, OutboundMessage};
use crate::envelope::{Payload, RequestEnvelope, ResponseEnvelope};
use crate::topic::Topic;

/// Default time to wait for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side RPC configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Seconds to wait for a reply before answering `timeout`.
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Publishes requests to one request queue and waits for correlated replies.
///
/// Clones made with [`RpcClient::for_queue`] share the broker and the
/// pending-call table.
#[derive(Clone)]
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    router: Arc<ReplyRouter>,
    request_queue: String,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, request_queue: impl Into<String>) -> Self {
        Self {
            broker,
            router: Arc::new(ReplyRouter::new()),
            request_queue: request_queue.into(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Client for the request queue of `topic`.
    pub fn for_topic(broker: Arc<dyn Broker>, topic: Topic) -> Self {
        Self::new(broker, topic.queue())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// A client for another request queue sharing this one's router.
    pub fn for_queue(&self, request_queue: impl Into<String>) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            router: Arc::clone(&self.router),
            request_queue: request_queue.into(),
            default_timeout: self.default_timeout,
        }
    }

    /// Calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.router.pending_count()
    }

    /// Call `action` with the default timeout.
    pub async fn call(&self, action: &str, payload: Payload) -> ResponseEnvelope {
        self.call_with_timeout(action, payload, self.default_timeout)
            .await
    }

    /// Call `action`, answering within `timeout` of entry.
    ///
    /// The deadline covers the whole call, including reply queue setup and
    /// the request publish.
    #[tracing::instrument(name = "rpc.call", skip_all, fields(action = %action, queue = %self.request_queue))]
    pub async fn call_with_timeout(
        &self,
        action: &str,
        payload: Payload,
        timeout: Duration,
    ) -> ResponseEnvelope {
        if action.is_empty() || timeout.is_zero() {
            return ResponseEnvelope::invalid_request();
        }
        let deadline = Instant::now() + timeout;

        let reply_queue = match self.broker.declare_reply_queue().await {
            Ok(queue) => queue,
            Err(e) => {
                error!(error = %e, "Broker unavailable, could not declare reply queue");
                return ResponseEnvelope::service_unavailable();
            }
        };

        let response = match tokio::time::timeout_at(
            deadline,
            self.exchange(action, payload, &reply_queue),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(queue = %reply_queue, "No reply before deadline");
                ResponseEnvelope::timeout()
            }
        };

        if let Err(e) = self.broker.delete_queue(&reply_queue).await {
            warn!(queue = %reply_queue, error = %e, "Failed to delete reply queue");
        }

        response
    }

    /// Register, subscribe, publish and wait, with `reply_queue` already
    /// declared. Runs under the caller's deadline; cancelling it drops the
    /// pending slot.
    async fn exchange(&self, action: &str, payload: Payload, reply_queue: &str) -> ResponseEnvelope {
        let correlation_id = Uuid::new_v4().to_string();
        let mut pending = self.router.register(correlation_id.as_str());

        let replies = match self.broker.consume(reply_queue).await {
            Ok(replies) => replies,
            Err(e) => {
                error!(error = %e, "Broker unavailable, could not consume reply queue");
                return ResponseEnvelope::service_unavailable();
            }
        };

        let request = RequestEnvelope::new(action, payload);
        let message = OutboundMessage::new(request.to_bytes())
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_queue);

        if let Err(e) = self.broker.publish(&self.request_queue, message).await {
            error!(error = %e, "Broker refused request");
            return ResponseEnvelope::service_unavailable();
        }

        debug!(correlation_id = %correlation_id, "Request published, awaiting reply");

        let reply = tokio::select! {
            reply = &mut pending => reply,
            // Consumer ended (broker went away mid-wait): keep waiting,
            // the deadline decides.
            () = self.router.route(replies) => (&mut pending).await,
        };

        reply.unwrap_or_else(|| {
            warn!(correlation_id = %correlation_id, "Pending call dropped without reply");
            ResponseEnvelope::timeout()
        })
    }
}

#[cfg(test)]
mod tests;
