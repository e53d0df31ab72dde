//! # Structured Logging Module
//!
//! Environment-aware structured logging for the scheduler and its workers.
//!
//! `RUST_LOG` wins when set; otherwise `telemetry.log_level`, otherwise a level
//! derived from the environment (`debug` for development and test, `info` for
//! production).

use crate::config::TelemetryConfig;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
pub fn init_structured_logging(telemetry: &TelemetryConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = telemetry
            .log_level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let layer = if telemetry.json_logs {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Another subscriber (e.g. from a test harness) may already be installed
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            service = %telemetry.service_name,
            json = telemetry.json_logs,
            "Structured logging initialized"
        );
    });
}

/// Current environment name
pub fn get_environment() -> String {
    std::env::var("LIFECYCLE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log the outcome of one step invocation
pub fn log_step_processed(
    operation_id: &str,
    step_name: &str,
    duration_ms: u64,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation_id = %operation_id,
        step_name = %step_name,
        duration_ms = duration_ms,
        status = %status,
        details = details,
        "STEP_PROCESSED"
    );
}
