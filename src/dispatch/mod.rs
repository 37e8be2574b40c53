//! Worker-side dispatcher.
//!
//! A `Dispatcher` consumes one durable request queue and routes every message
//! by its `action` to a handler from a static `ActionTable`. Each message goes
//! through:
//!
//! ```text
//! RECEIVED -> PARSED -> DISPATCHED -> REPLIED -> ACKED
//!          -> REJECTED (malformed) -> REPLIED -> ACKED
//!                       DISPATCHED -> FAILED -> REPLIED -> ACKED
//! ```
//!
//! The inbound message is acked only after the reply is published (or skipped
//! for fire-and-forget requests), so a crash mid-handler leads to redelivery.
//! The dispatcher never retries; redelivery is the broker's job.

mod handler;

pub use handler::{ActionHandler, ActionTable, HandlerError, HandlerResult};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BusError, Delivery, DeliveryStream, OutboundMessage};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::topic::Topic;

/// Errors from building or running a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Action already registered: {0}")]
    DuplicateAction(String),

    #[error("Action name must not be empty")]
    EmptyAction,

    #[error("No handlers for topic {0}")]
    UnservedTopic(Topic),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Lifecycle states of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Parsed,
    Dispatched,
    Failed,
    Rejected,
    Replied,
    Acked,
}

/// Trace of one processed message.
#[derive(Debug, Clone)]
pub struct ProcessedDelivery {
    /// States the message went through, in order.
    pub states: Vec<DeliveryState>,
    /// Response produced for the message, published or not.
    pub response: ResponseEnvelope,
}

impl ProcessedDelivery {
    pub fn final_state(&self) -> Option<DeliveryState> {
        self.states.last().copied()
    }
}

/// Consumes one request queue and answers each request by action.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    queue: String,
    table: Arc<ActionTable>,
    backoff: ExponentialBuilder,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, table: ActionTable) -> Self {
        // Exponential backoff with jitter between consumer reconnects
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        Self {
            broker,
            queue: queue.into(),
            table: Arc::new(table),
            backoff,
        }
    }

    /// Dispatcher for the request queue of `topic`.
    pub fn for_topic(broker: Arc<dyn Broker>, topic: Topic, table: ActionTable) -> Self {
        Self::new(broker, topic.queue(), table)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn actions(&self) -> Vec<&str> {
        self.table.actions()
    }

    /// Produce the response for one request body, recording the states it
    /// passes through after `Received`.
    pub async fn dispatch(&self, body: &[u8], states: &mut Vec<DeliveryState>) -> ResponseEnvelope {
        let request = match RequestEnvelope::parse(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Rejecting malformed request");
                states.push(DeliveryState::Rejected);
                return ResponseEnvelope::invalid_request();
            }
        };
        states.push(DeliveryState::Parsed);

        let Some(handler) = self.table.get(&request.action) else {
            warn!(queue = %self.queue, action = %request.action, "Unknown action");
            return ResponseEnvelope::unknown_action(&request.action);
        };

        states.push(DeliveryState::Dispatched);
        debug!(action = %request.action, "Dispatching to handler");

        match invoke(handler.as_ref(), request.payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!(action = %request.action, error = %e, "Handler failed");
                states.push(DeliveryState::Failed);
                ResponseEnvelope::error(format!("Server error: {}", e))
            }
        }
    }

    /// Run one delivery through parse, dispatch, reply and ack.
    ///
    /// When the reply cannot be published the delivery is left unacked and
    /// the bus error is returned; the broker redelivers it once this
    /// consumer goes away.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<ProcessedDelivery, DispatchError> {
        let mut states = vec![DeliveryState::Received];
        if delivery.redelivered {
            debug!(queue = %self.queue, "Processing redelivered message");
        }

        let response = self.dispatch(&delivery.body, &mut states).await;

        if let Some((reply_to, correlation_id)) = delivery.reply_address() {
            let reply = OutboundMessage::new(response.to_bytes()).with_correlation_id(correlation_id);
            self.broker.publish(reply_to, reply).await?;
            states.push(DeliveryState::Replied);
        } else {
            debug!(queue = %self.queue, "No reply address, skipping reply");
        }

        delivery.ack().await?;
        states.push(DeliveryState::Acked);

        debug!(queue = %self.queue, states = ?states, "Message processed");
        Ok(ProcessedDelivery { states, response })
    }

    /// Consume the queue forever.
    pub async fn run(&self) {
        self.run_until(futures::future::pending::<()>()).await
    }

    /// Consume the queue until `shutdown` completes.
    ///
    /// Setup failures and ended consumer streams are retried with exponential
    /// backoff and jitter. The message in flight when `shutdown` fires is
    /// finished first.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut backoff = self.backoff.build();
        let max_delay = Duration::from_secs(30);

        loop {
            match self.setup_consumer().await {
                Ok(mut deliveries) => {
                    info!(queue = %self.queue, actions = ?self.table.actions(), "Dispatcher consuming");
                    backoff = self.backoff.build();

                    loop {
                        let next = tokio::select! {
                            () = &mut shutdown => {
                                info!(queue = %self.queue, "Dispatcher shutting down");
                                return;
                            }
                            next = deliveries.next() => next,
                        };

                        match next {
                            Some(Ok(delivery)) => {
                                if let Err(e) = self.process_delivery(delivery).await {
                                    error!(queue = %self.queue, error = %e, "Failed to complete delivery");
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                            None => {
                                info!(queue = %self.queue, "Consumer stream ended, reconnecting...");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to set up consumer");
                }
            }

            let delay = backoff.next().unwrap_or(max_delay);
            debug!(queue = %self.queue, backoff_ms = %delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                () = &mut shutdown => {
                    info!(queue = %self.queue, "Dispatcher shutting down");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn setup_consumer(&self) -> Result<DeliveryStream, BusError> {
        self.broker.declare_queue(&self.queue).await?;
        self.broker.consume(&self.queue).await
    }
}

/// Call a handler, turning a panic in either the call or its future into a
/// `HandlerError`.
async fn invoke(handler: &dyn ActionHandler, payload: crate::envelope::Payload) -> HandlerResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload))) {
        Ok(future) => future,
        Err(panic) => return Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
