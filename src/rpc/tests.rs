use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::time::Instant;

use crate::bus::{BusError, ChannelBroker, Delivery, DeliveryStream};
use crate::dispatch::{ActionTable, Dispatcher, HandlerError};
use crate::envelope::{INVALID_REQUEST, SERVICE_UNAVAILABLE, TIMEOUT};

const QUEUE: &str = "frontend_to_backend";

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error")
}

async fn reply(broker: &ChannelBroker, request: &Delivery, response: ResponseEnvelope) {
    let (reply_to, correlation_id) = request.reply_address().expect("request has reply address");
    broker
        .publish(
            reply_to,
            OutboundMessage::new(response.to_bytes()).with_correlation_id(correlation_id),
        )
        .await
        .unwrap();
}

async fn setup() -> (ChannelBroker, RpcClient) {
    let broker = ChannelBroker::new();
    broker.declare_queue(QUEUE).await.unwrap();
    let client = RpcClient::new(Arc::new(broker.clone()), QUEUE);
    (broker, client)
}

#[tokio::test]
async fn test_call_passes_handler_response_through() {
    let (broker, client) = setup().await;
    let mut table = ActionTable::new();
    table
        .register("echo", |payload: Payload| async move {
            Ok::<_, HandlerError>(
                ResponseEnvelope::success()
                    .with_message("echoed")
                    .with("payload", serde_json::Value::Object(payload)),
            )
        })
        .unwrap();
    let dispatcher = Dispatcher::new(Arc::new(broker.clone()), QUEUE, table);
    let worker = tokio::spawn(async move { dispatcher.run().await });

    let response = client.call("echo", payload(json!({"n": 1, "s": "x"}))).await;

    assert!(response.is_success());
    assert_eq!(response.message.as_deref(), Some("echoed"));
    assert_eq!(response.data["payload"], json!({"n": 1, "s": "x"}));
    assert_eq!(client.pending_calls(), 0);
    worker.abort();
}

#[tokio::test]
async fn test_request_carries_correlation_and_reply_queue() {
    let (broker, client) = setup().await;
    let mut requests = broker.consume(QUEUE).await.unwrap();

    let call = client.call(
        "login",
        payload(json!({"email": "a@b.com", "password": "x"})),
    );
    let respond = async {
        let request = next(&mut requests).await;
        let (reply_to, correlation_id) = request.reply_address().unwrap();
        assert!(reply_to.starts_with("amq.gen-"));
        assert!(!correlation_id.is_empty());

        let envelope = RequestEnvelope::parse(&request.body).unwrap();
        assert_eq!(envelope.action, "login");
        assert_eq!(envelope.payload["email"], json!("a@b.com"));

        reply(
            &broker,
            &request,
            ResponseEnvelope::success()
                .with_message("Login successful")
                .with("token", "tok-1"),
        )
        .await;
        request.ack().await.unwrap();
    };

    let (response, ()) = tokio::join!(call, respond);

    assert!(response.is_success());
    assert_eq!(response.message.as_deref(), Some("Login successful"));
    assert_eq!(response.data["token"], json!("tok-1"));
    // Only the request queue is left; the reply queue was deleted.
    assert_eq!(broker.queue_count(), 1);
}

#[tokio::test]
async fn test_concurrent_calls_receive_their_own_replies() {
    let (broker, client) = setup().await;
    let mut requests = broker.consume(QUEUE).await.unwrap();

    let first = client.call("login", payload(json!({"who": "first"})));
    let other = client.for_queue(QUEUE);
    let second = other.call("login", payload(json!({"who": "second"})));
    let respond = async {
        let a = next(&mut requests).await;
        let b = next(&mut requests).await;
        // Answer in reverse order of arrival.
        for request in [b, a] {
            let who = RequestEnvelope::parse(&request.body).unwrap().payload["who"].clone();
            reply(&broker, &request, ResponseEnvelope::success().with("who", who)).await;
            request.ack().await.unwrap();
        }
    };

    let (first, second, ()) = tokio::join!(first, second, respond);

    assert_eq!(first.data["who"], json!("first"));
    assert_eq!(second.data["who"], json!("second"));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_unmatched_reply_is_ignored() {
    let (broker, client) = setup().await;
    let mut requests = broker.consume(QUEUE).await.unwrap();

    let call = client.call("login", Payload::new());
    let respond = async {
        let request = next(&mut requests).await;
        let (reply_to, _) = request.reply_address().unwrap();
        broker
            .publish(
                reply_to,
                OutboundMessage::new(ResponseEnvelope::error("stray").to_bytes())
                    .with_correlation_id("someone-else"),
            )
            .await
            .unwrap();
        reply(&broker, &request, ResponseEnvelope::success()).await;
    };

    let (response, ()) = tokio::join!(call, respond);

    assert_eq!(response, ResponseEnvelope::success());
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_without_leaking_pending_calls() {
    let (broker, client) = setup().await;
    let timeout = Duration::from_secs(5);

    for _ in 0..3 {
        let started = Instant::now();
        let response = client.call_with_timeout("login", Payload::new(), timeout).await;
        let elapsed = started.elapsed();

        assert_eq!(response, ResponseEnvelope::error(TIMEOUT));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(100));
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(broker.queue_count(), 1);
    }
    // Nobody consumed the requests.
    assert_eq!(broker.queue_depth(QUEUE), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reply_after_timeout_is_dropped() {
    let (broker, client) = setup().await;
    let mut requests = broker.consume(QUEUE).await.unwrap();

    let response = client
        .call_with_timeout("login", Payload::new(), Duration::from_secs(1))
        .await;
    assert_eq!(response, ResponseEnvelope::timeout());

    // The worker answers late, to a reply queue that no longer exists.
    let request = next(&mut requests).await;
    let reply_to = request.reply_to.clone().unwrap();
    reply(&broker, &request, ResponseEnvelope::success()).await;
    assert!(!broker.queue_exists(&reply_to));
    assert_eq!(client.pending_calls(), 0);
}

/// Broker whose publishes take `delay` to be confirmed.
struct SlowPublish {
    inner: ChannelBroker,
    delay: Duration,
}

#[async_trait]
impl Broker for SlowPublish {
    async fn declare_queue(&self, queue: &str) -> Result<(), BusError> {
        self.inner.declare_queue(queue).await
    }

    async fn declare_reply_queue(&self) -> Result<String, BusError> {
        self.inner.declare_reply_queue().await
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BusError> {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(queue, message).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BusError> {
        self.inner.consume(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BusError> {
        self.inner.delete_queue(queue).await
    }
}

/// Client whose request publishes take two seconds, plus a worker that
/// answers each request `reply_at` after `started`.
async fn slow_setup(started: Instant, reply_at: Duration) -> (RpcClient, tokio::task::JoinHandle<()>) {
    let broker = ChannelBroker::new();
    broker.declare_queue(QUEUE).await.unwrap();
    let slow = SlowPublish {
        inner: broker.clone(),
        delay: Duration::from_secs(2),
    };
    let client = RpcClient::new(Arc::new(slow), QUEUE);

    let mut requests = broker.consume(QUEUE).await.unwrap();
    let worker = tokio::spawn(async move {
        while let Some(Ok(request)) = requests.next().await {
            tokio::time::sleep_until(started + reply_at).await;
            reply(&broker, &request, ResponseEnvelope::success().with_message("late but in time")).await;
            request.ack().await.unwrap();
        }
    });
    (client, worker)
}

#[tokio::test(start_paused = true)]
async fn test_deadline_counts_from_call_entry() {
    let started = Instant::now();
    let (client, worker) = slow_setup(started, Duration::from_secs(6)).await;

    // Publish finishes at 2s; the 5s deadline still holds from entry.
    let response = client
        .call_with_timeout("login", Payload::new(), Duration::from_secs(5))
        .await;

    assert_eq!(response, ResponseEnvelope::timeout());
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(client.pending_calls(), 0);
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn test_reply_within_deadline_after_slow_publish_is_delivered() {
    let started = Instant::now();
    let (client, worker) = slow_setup(started, Duration::from_millis(4500)).await;

    let response = client
        .call_with_timeout("login", Payload::new(), Duration::from_secs(5))
        .await;

    assert!(response.is_success(), "unexpected response: {:?}", response);
    assert_eq!(response.message.as_deref(), Some("late but in time"));
    assert!(started.elapsed() < Duration::from_secs(5));
    worker.abort();
}

#[tokio::test]
async fn test_unavailable_broker_answers_service_unavailable() {
    let (broker, client) = setup().await;
    broker.set_available(false);

    let response = client.call("login", Payload::new()).await;

    assert_eq!(response, ResponseEnvelope::error(SERVICE_UNAVAILABLE));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_broker_loss_mid_wait_times_out() {
    let (broker, client) = setup().await;
    let mut requests = broker.consume(QUEUE).await.unwrap();

    let call = client.call_with_timeout("login", Payload::new(), Duration::from_secs(2));
    let fail = async {
        let _request = next(&mut requests).await;
        broker.set_available(false);
    };

    let (response, ()) = tokio::join!(call, fail);

    assert_eq!(response, ResponseEnvelope::timeout());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_invalid_arguments_answer_invalid_request() {
    let (broker, client) = setup().await;

    let empty_action = client.call("", Payload::new()).await;
    let zero_timeout = client
        .call_with_timeout("login", Payload::new(), Duration::ZERO)
        .await;

    assert_eq!(empty_action, ResponseEnvelope::error(INVALID_REQUEST));
    assert_eq!(zero_timeout, ResponseEnvelope::error(INVALID_REQUEST));
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn test_login_end_to_end() {
    let (broker, client) = setup().await;
    let logins = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&logins);

    let mut table = ActionTable::new();
    table
        .register("login", move |payload: Payload| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = match payload.get("email").and_then(|v| v.as_str()) {
                    Some("a@b.com") => ResponseEnvelope::success()
                        .with_message("Login successful")
                        .with("user", json!({"email": "a@b.com"})),
                    _ => ResponseEnvelope::error("Invalid credentials"),
                };
                Ok::<_, HandlerError>(response)
            }
        })
        .unwrap();
    let dispatcher = Dispatcher::for_topic(Arc::new(broker.clone()), Topic::Auth, table);
    let worker = tokio::spawn(async move { dispatcher.run().await });

    let ok = client
        .call("login", payload(json!({"email": "a@b.com", "password": "x"})))
        .await;
    let denied = client
        .call("login", payload(json!({"email": "z@b.com", "password": "x"})))
        .await;
    let unknown = client.call("teleport", Payload::new()).await;

    assert_eq!(ok.status, crate::envelope::Status::Success);
    assert_eq!(ok.data["user"]["email"], json!("a@b.com"));
    assert_eq!(denied.message.as_deref(), Some("Invalid credentials"));
    assert_eq!(unknown.message.as_deref(), Some("Unknown action: teleport"));
    assert_eq!(logins.load(Ordering::SeqCst), 2);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    worker.abort();
}

#[test]
fn test_rpc_config_default_timeout() {
    let config = RpcConfig::default();
    assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
    assert_eq!(config.timeout_secs, 30);
}
