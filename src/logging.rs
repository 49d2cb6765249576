//! Tracing setup for the operator binary and for long-running workers.
//!
//! - stdout layer, always on
//! - optional daily-rotated `session.log` (text) and `session.json.log` (JSON) files
//! - `RUST_LOG` filtering, default `info`

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the background file writers alive. Drop it only at process exit.
#[must_use]
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn stdout_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter())
}

/// Initialize the global subscriber.
///
/// With `log_dir` set, logs are also written to rotating files in that directory
/// (created if missing).
///
/// # Environment Variables
/// * `RUST_LOG` - e.g. `RUST_LOG=crawl_session=debug,redis=warn`
pub fn init_logging(log_dir: Option<&Path>) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let Some(log_path) = log_dir else {
        tracing_subscriber::registry().with(stdout_layer()).try_init()?;
        return Ok(LoggingGuard { _guards: Vec::new() });
    };

    std::fs::create_dir_all(log_path)?;

    let text_file_appender = tracing_appender::rolling::daily(log_path, "session.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_file_appender);

    let json_file_appender = tracing_appender::rolling::daily(log_path, "session.json.log");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_file_appender);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer())
        .try_init()?;

    tracing::debug!("File logs: {}/session.log", log_path.display());

    Ok(LoggingGuard {
        _guards: vec![text_guard, json_guard],
    })
}

/// Test-friendly subscriber writing through the test harness. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}
