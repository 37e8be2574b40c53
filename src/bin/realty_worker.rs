//! realty-worker: Request dispatchers
//!
//! Consumes the request queues of the configured topics and answers each
//! request by action.
//!
//! ## Architecture
//! ```text
//! [Gateway] -> [request queue] -> [realty-worker] -> [handler]
//!     ^                                  |
//!     +-------- [reply queue] <----------+
//! ```
//!
//! ## Configuration
//! - REALTY_CONFIG: path to the YAML config (default: config.yaml)
//! - REALTY_MESSAGING_TYPE: amqp or channel
//! - AMQP_URL: broker URL
//! - WORKER_TOPIC: comma-separated topics to serve, `auth` and/or
//!   `property_management` (default: property_management)
//! - REALTY_LOG: log filter (default: info)

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use realty_rpc::bus::{declare_topology, init_broker, MessagingType};
use realty_rpc::config::Config;
use realty_rpc::dispatch::Dispatcher;
use realty_rpc::handlers::{action_table, Stores};
use realty_rpc::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};

const CONNECT_ATTEMPTS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if config.messaging.messaging_type == MessagingType::Channel {
        info!("Channel broker is process-local; only this process can reach these queues");
    }

    let broker = connect_with_retry("broker", CONNECT_ATTEMPTS, || init_broker(&config.messaging))
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    declare_topology(broker.as_ref()).await?;

    let stores = Stores::in_memory();
    let (stop, stopped) = watch::channel(false);
    let mut workers = JoinSet::new();

    for topic in config.worker.topics.iter().copied() {
        let table = action_table(topic, &stores)?;
        let dispatcher = Dispatcher::for_topic(Arc::clone(&broker), topic, table);
        info!(topic = %topic, queue = dispatcher.queue(), actions = ?dispatcher.actions(), "Starting dispatcher");

        let mut stopped = stopped.clone();
        workers.spawn(async move {
            dispatcher
                .run_until(async move {
                    let _ = stopped.changed().await;
                })
                .await
        });
    }

    info!("realty-worker running, press Ctrl+C to exit");
    shutdown_signal().await;

    let _ = stop.send(true);
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Dispatcher task failed");
        }
    }

    Ok(())
}
