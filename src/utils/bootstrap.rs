//! Bootstrap utilities for the realty binaries.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter.
pub const LOG_ENV_VAR: &str = "REALTY_LOG";

/// Initialize tracing with the REALTY_LOG environment variable.
///
/// Defaults to "info" level if REALTY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to the broker with exponential backoff.
///
/// Gives up after `max_attempts` and returns the last error.
pub async fn connect_with_retry<T, E, F, Fut>(
    target: &str,
    max_attempts: usize,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_attempts.saturating_sub(1))
        .build();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connected) => {
                info!(service = %target, attempt, "Connected");
                return Ok(connected);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = %target,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(service = %target, attempts = attempt, error = %e, "Giving up connecting");
                    return Err(e);
                }
            },
        }
    }
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
