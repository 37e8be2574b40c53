//! realty-gateway: HTTP front door
//!
//! Accepts JSON request envelopes over HTTP and forwards them as RPC calls
//! over the broker. In channel (standalone) mode it also runs the auth and
//! property-management dispatchers in-process, since nothing outside this
//! process can reach the in-memory queues.
//!
//! ## Configuration
//! - REALTY_CONFIG: path to the YAML config (default: config.yaml)
//! - REALTY_MESSAGING_TYPE: amqp or channel (default: channel)
//! - AMQP_URL: broker URL
//! - GATEWAY_PORT: HTTP port (default: 8080)
//! - RPC_TIMEOUT_SECS: reply timeout (default: 30)
//! - REALTY_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use realty_rpc::bus::{declare_topology, init_broker, MessagingType};
use realty_rpc::config::Config;
use realty_rpc::dispatch::Dispatcher;
use realty_rpc::gateway::{self, Gateway};
use realty_rpc::handlers::{action_table, Stores, SERVED_TOPICS};
use realty_rpc::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};

const CONNECT_ATTEMPTS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        messaging_type = ?config.messaging.messaging_type,
        timeout_secs = config.rpc.timeout_secs,
        "Starting realty-gateway"
    );

    let broker = connect_with_retry("broker", CONNECT_ATTEMPTS, || init_broker(&config.messaging))
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    declare_topology(broker.as_ref()).await?;

    if config.messaging.messaging_type == MessagingType::Channel {
        let stores = Stores::in_memory();
        for &topic in SERVED_TOPICS {
            let table = action_table(topic, &stores)?;
            let dispatcher = Dispatcher::for_topic(Arc::clone(&broker), topic, table);
            info!(topic = %topic, queue = dispatcher.queue(), "Running dispatcher in-process");
            tokio::spawn(async move { dispatcher.run().await });
        }
    }

    let gateway = Arc::new(Gateway::new(broker, config.rpc_timeout()));

    tokio::select! {
        result = gateway::serve(gateway, &config.gateway.host, config.gateway.port) => {
            result.map_err(|e| -> Box<dyn std::error::Error> { e })?;
        }
        () = shutdown_signal() => {
            info!("realty-gateway stopped");
        }
    }

    Ok(())
}
