//! Reply routing by correlation id.
//!
//! The router owns the pending-call table: correlation id -> single-use slot.
//! A slot is created by `register` and removed exactly once, either when a
//! matching reply resolves it or when its `PendingCall` guard is dropped
//! (timeout, broker failure, or the calling future being cancelled).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{Delivery, DeliveryStream};
use crate::envelope::{ResponseEnvelope, INVALID_RESPONSE};

struct Slot {
    sender: oneshot::Sender<ResponseEnvelope>,
    generation: u64,
}

/// What happened to one inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to its waiting call.
    Resolved,
    /// No pending call under that id (unknown, late, or already resolved).
    Unmatched,
    /// The reply carried no correlation id.
    Uncorrelated,
}

/// Matches reply messages to waiting calls.
#[derive(Default)]
pub struct ReplyRouter {
    pending: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Open a slot for `correlation_id`.
    ///
    /// The slot lives as long as the returned guard; the caller's deadline
    /// decides when to stop waiting.
    ///
    /// Correlation ids are single-use; registering an id that is already
    /// pending replaces the older slot, whose waiter then sees no reply.
    pub fn register(&self, correlation_id: impl Into<String>) -> PendingCall<'_> {
        let correlation_id = correlation_id.into();
        let (sender, receiver) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            sender,
            generation,
        };
        if self.pending().insert(correlation_id.clone(), slot).is_some() {
            warn!(correlation_id = %correlation_id, "Correlation id reused while pending");
        }
        PendingCall {
            router: self,
            correlation_id,
            generation,
            receiver,
        }
    }

    /// Hand a reply body to the call waiting on `correlation_id`.
    ///
    /// Matching is exact string equality. Bodies that are not a response
    /// envelope resolve the call with an `Invalid response` error.
    pub fn resolve(&self, correlation_id: Option<&str>, body: &[u8]) -> RouteOutcome {
        let Some(correlation_id) = correlation_id else {
            debug!("Dropping reply without correlation id");
            return RouteOutcome::Uncorrelated;
        };

        let Some(slot) = self.pending().remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "Dropping unmatched reply");
            return RouteOutcome::Unmatched;
        };

        let response = ResponseEnvelope::parse(body).unwrap_or_else(|e| {
            warn!(correlation_id = %correlation_id, error = %e, "Reply is not a response envelope");
            ResponseEnvelope::error(INVALID_RESPONSE)
        });

        if slot.sender.send(response).is_err() {
            debug!(correlation_id = %correlation_id, "Caller stopped waiting before reply");
            return RouteOutcome::Unmatched;
        }
        RouteOutcome::Resolved
    }

    /// Route one delivery and acknowledge it.
    pub async fn route_delivery(&self, delivery: Delivery) -> RouteOutcome {
        let outcome = self.resolve(delivery.correlation_id.as_deref(), &delivery.body);
        if let Err(e) = delivery.ack().await {
            debug!(error = %e, "Failed to ack reply");
        }
        outcome
    }

    /// Route every delivery of a reply queue until the stream ends.
    pub async fn route(&self, mut replies: DeliveryStream) {
        while let Some(delivery) = replies.next().await {
            match delivery {
                Ok(delivery) => {
                    self.route_delivery(delivery).await;
                }
                Err(e) => {
                    warn!(error = %e, "Reply consumer failed");
                    break;
                }
            }
        }
    }

    fn deregister(&self, correlation_id: &str, generation: u64) {
        let mut pending = self.pending();
        if pending.get(correlation_id).map(|s| s.generation) == Some(generation) {
            pending.remove(correlation_id);
        }
    }
}

/// A registered call awaiting its reply.
///
/// Resolves to `Some(response)` on a match, or `None` if the slot was dropped
/// without one. Dropping the guard removes the slot from the table.
pub struct PendingCall<'a> {
    router: &'a ReplyRouter,
    correlation_id: String,
    generation: u64,
    receiver: oneshot::Receiver<ResponseEnvelope>,
}

impl Future for PendingCall<'_> {
    type Output = Option<ResponseEnvelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(Result::ok)
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.router.deregister(&self.correlation_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(data: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&data).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_matching_call() {
        let router = ReplyRouter::new();
        let pending = router.register("c1");

        let outcome = router.resolve(Some("c1"), &reply(json!({"status": "success", "n": 1})));

        assert_eq!(outcome, RouteOutcome::Resolved);
        let response = pending.await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.data["n"], json!(1));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_in_reverse_order_reach_their_own_calls() {
        let router = ReplyRouter::new();
        let first = router.register("c1");
        let second = router.register("c2");

        router.resolve(Some("c2"), &reply(json!({"status": "success", "who": "second"})));
        router.resolve(Some("c1"), &reply(json!({"status": "success", "who": "first"})));

        assert_eq!(first.await.unwrap().data["who"], json!("first"));
        assert_eq!(second.await.unwrap().data["who"], json!("second"));
    }

    #[test]
    fn test_matching_is_exact_and_case_sensitive() {
        let router = ReplyRouter::new();
        let _pending = router.register("abc");
        let body = reply(json!({"status": "success"}));

        assert_eq!(router.resolve(Some("ABC"), &body), RouteOutcome::Unmatched);
        assert_eq!(router.resolve(Some("ab"), &body), RouteOutcome::Unmatched);
        assert_eq!(router.pending_count(), 1);
    }

    #[test]
    fn test_duplicate_reply_is_dropped() {
        let router = ReplyRouter::new();
        let _pending = router.register("c1");
        let body = reply(json!({"status": "success"}));

        assert_eq!(router.resolve(Some("c1"), &body), RouteOutcome::Resolved);
        assert_eq!(router.resolve(Some("c1"), &body), RouteOutcome::Unmatched);
    }

    #[test]
    fn test_stale_guard_keeps_replacement_slot() {
        let router = ReplyRouter::new();
        let stale = router.register("c1");
        let _fresh = router.register("c1");

        drop(stale);

        assert_eq!(router.pending_count(), 1);
    }

    #[test]
    fn test_uncorrelated_reply_is_dropped() {
        let router = ReplyRouter::new();
        let body = reply(json!({"status": "success"}));
        assert_eq!(router.resolve(None, &body), RouteOutcome::Uncorrelated);
    }

    #[test]
    fn test_dropping_pending_call_deregisters() {
        let router = ReplyRouter::new();
        let pending = router.register("c1");
        assert_eq!(router.pending_count(), 1);

        drop(pending);

        assert_eq!(router.pending_count(), 0);
        let body = reply(json!({"status": "success"}));
        assert_eq!(router.resolve(Some("c1"), &body), RouteOutcome::Unmatched);
    }

    #[test]
    fn test_pending_call_waits_until_resolved() {
        let router = ReplyRouter::new();
        let mut pending = tokio_test::task::spawn(router.register("c1"));

        tokio_test::assert_pending!(pending.poll());

        router.resolve(Some("other"), &reply(json!({"status": "success"})));
        tokio_test::assert_pending!(pending.poll());

        router.resolve(Some("c1"), &reply(json!({"status": "success"})));
        assert!(pending.is_woken());
        let response = tokio_test::assert_ready!(pending.poll());
        assert!(response.is_some_and(|r| r.is_success()));
    }

    #[tokio::test]
    async fn test_malformed_reply_resolves_as_invalid_response() {
        let router = ReplyRouter::new();
        let pending = router.register("c1");

        router.resolve(Some("c1"), b"<html>");

        let response = pending.await.unwrap();
        assert_eq!(response, ResponseEnvelope::error(INVALID_RESPONSE));
    }
}
