//! Realty RPC - request/reply over a message broker
//!
//! HTTP handlers call `RpcClient::call(action, payload)` as if it were a local
//! async function. The call travels as a JSON envelope over a per-topic
//! request queue; a `Dispatcher` on the worker side routes it by action to a
//! handler and publishes the reply to the caller's transient reply queue,
//! where the `ReplyRouter` matches it back by correlation id.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod gateway;
pub mod handlers;
pub mod rpc;
pub mod topic;
pub mod utils;

pub use envelope::{Payload, RequestEnvelope, ResponseEnvelope, Status};
pub use rpc::RpcClient;
pub use topic::Topic;
