//! Tracing subscriber setup and shared metric helpers.

use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::{EngineConfig, LogFormat};
use crate::error::EngineError;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &EngineConfig) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
}

/// Records the duration of an engine operation and counts its rejection, if any.
pub(crate) fn observe<T>(
    operation: &'static str,
    started: Instant,
    result: &Result<T, EngineError>,
) {
    metrics::histogram!("ledger_operation_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());

    if let Err(err) = result {
        if err.is_retryable() {
            tracing::warn!(operation, error = %err, "operation gave up");
        } else {
            tracing::info!(operation, reason = err.reason(), "operation rejected");
        }
        metrics::counter!(
            "ledger_operation_errors_total",
            "operation" => operation,
            "reason" => err.reason()
        )
        .increment(1);
    }
}
