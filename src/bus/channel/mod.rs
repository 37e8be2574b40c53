//! In-memory channel-based broker for standalone mode.
//!
//! Named queues live in a shared table guarded by a mutex; consumers wait on a
//! per-queue `Notify`. Consumers on the same queue compete for messages.
//! Deliveries stay unacked until their `Delivery::ack` runs; when a consumer
//! stream is dropped its unacked deliveries go back to the front of the queue
//! flagged as redelivered, and auto-delete queues disappear with their last
//! consumer. Ideal for local development and testing without external
//! dependencies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Acker, Broker, BusError, Delivery, DeliveryStream, OutboundMessage, Result};

/// Prefix of broker-assigned reply queue names.
const REPLY_QUEUE_PREFIX: &str = "amq.gen-";

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
}

impl From<OutboundMessage> for StoredMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            body: message.body,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            redelivered: false,
        }
    }
}

struct QueueState {
    messages: VecDeque<StoredMessage>,
    durable: bool,
    auto_delete: bool,
    consumers: usize,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(durable: bool, auto_delete: bool) -> Self {
        Self {
            messages: VecDeque::new(),
            durable,
            auto_delete,
            consumers: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Unacked {
    queue: String,
    consumer: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_consumer: u64,
    acks: u64,
}

struct Inner {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Connection("channel broker is unavailable".to_string()))
        }
    }
}

/// In-memory broker.
///
/// Cloning shares the same queues, so a gateway and in-process workers can
/// talk through one instance.
#[derive(Clone)]
pub struct ChannelBroker {
    inner: Arc<Inner>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the broker going away (or coming back).
    ///
    /// While unavailable every operation fails with `BusError::Connection`.
    /// Existing consumer streams stay open but receive nothing new.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }

    /// Ready (not yet delivered) messages in a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.state().queues.len()
    }

    /// Delivered messages awaiting acknowledgement, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.inner.state().unacked.len()
    }

    /// Successful acknowledgements since creation.
    pub fn ack_count(&self) -> u64 {
        self.inner.state().acks
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state();
        match state.queues.get(queue) {
            Some(existing) if existing.durable => Ok(()),
            Some(_) => Err(BusError::Declare(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                queue
            ))),
            None => {
                state
                    .queues
                    .insert(queue.to_string(), QueueState::new(true, false));
                debug!(queue = %queue, "Declared queue");
                Ok(())
            }
        }
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        self.inner.ensure_available()?;
        let name = format!("{}{}", REPLY_QUEUE_PREFIX, uuid::Uuid::new_v4().simple());
        self.inner
            .state()
            .queues
            .insert(name.clone(), QueueState::new(false, true));
        debug!(queue = %name, "Declared reply queue");
        Ok(name)
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state();
        match state.queues.get_mut(queue) {
            Some(target) => {
                target.messages.push_back(message.into());
                target.notify.notify_waiters();
            }
            None => {
                // Default-exchange semantics: unroutable messages are dropped.
                debug!(queue = %queue, "No such queue, message dropped");
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.inner.ensure_available()?;
        let (consumer, notify) = {
            let mut state = self.inner.state();
            state.next_consumer += 1;
            let consumer = state.next_consumer;
            let target = state.queues.get_mut(queue).ok_or_else(|| {
                BusError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            target.consumers += 1;
            (consumer, Arc::clone(&target.notify))
        };

        debug!(queue = %queue, consumer, "Consumer started");

        let consumer = ChannelConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            consumer,
            notify,
        };

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok(delivery), consumer))
        });

        Ok(stream.boxed())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state();
        if let Some(removed) = state.queues.remove(queue) {
            state.unacked.retain(|_, u| u.queue != queue);
            removed.notify.notify_waiters();
            debug!(queue = %queue, "Deleted queue");
        }
        Ok(())
    }
}

/// Consumer side of one `consume` call. Dropping it cancels the consumer.
struct ChannelConsumer {
    inner: Arc<Inner>,
    queue: String,
    consumer: u64,
    notify: Arc<Notify>,
}

impl ChannelConsumer {
    /// Next delivery, or `None` once the queue is gone.
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.inner.state();
                let popped = match state.queues.get_mut(&self.queue) {
                    Some(q) if Arc::ptr_eq(&q.notify, &self.notify) => {
                        if self.inner.available.load(Ordering::SeqCst) {
                            q.messages.pop_front()
                        } else {
                            None
                        }
                    }
                    _ => return None,
                };

                if let Some(message) = popped {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    state.unacked.insert(
                        tag,
                        Unacked {
                            queue: self.queue.clone(),
                            consumer: self.consumer,
                            message: message.clone(),
                        },
                    );
                    return Some(Delivery::new(
                        message.body,
                        message.correlation_id,
                        message.reply_to,
                        message.redelivered,
                        Box::new(ChannelAcker {
                            inner: Arc::clone(&self.inner),
                            tag,
                        }),
                    ));
                }
            }
            notified.await;
        }
    }
}

impl Drop for ChannelConsumer {
    fn drop(&mut self) {
        let mut state = self.inner.state();

        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == self.consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let mut returned: Vec<StoredMessage> = tags
            .into_iter()
            .filter_map(|tag| state.unacked.remove(&tag))
            .map(|u| StoredMessage {
                redelivered: true,
                ..u.message
            })
            .collect();

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };
        if !Arc::ptr_eq(&queue.notify, &self.notify) {
            return;
        }

        queue.consumers = queue.consumers.saturating_sub(1);
        let requeued = returned.len();
        while let Some(message) = returned.pop() {
            queue.messages.push_front(message);
        }

        if queue.auto_delete && queue.consumers == 0 {
            if let Some(removed) = state.queues.remove(&self.queue) {
                removed.notify.notify_waiters();
            }
            debug!(queue = %self.queue, "Auto-deleted queue after last consumer");
        } else if requeued > 0 {
            queue.notify.notify_waiters();
            debug!(queue = %self.queue, requeued, "Requeued unacked deliveries");
        }
    }
}

struct ChannelAcker {
    inner: Arc<Inner>,
    tag: u64,
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state();
        if state.unacked.remove(&self.tag).is_none() {
            return Err(BusError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            )));
        }
        state.acks += 1;
        Ok(())
    }
}
