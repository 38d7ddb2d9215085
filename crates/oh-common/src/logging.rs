//! Structured Logging Configuration
//!
//! Every Ohana process logs through `tracing`. The subscriber is installed
//! once by the binary:
//!
//! ```rust,ignore
//! use oh_common::logging::init_logging;
//!
//! fn main() {
//!     init_logging("oh-relay");
//!     tracing::info!(tenant_id = %tenant, "Allocating federation resources");
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: Set to "json" for JSON output, anything else for text (default: text)
//! - `RUST_LOG`: Standard log level filter (default: info)
//!   Examples: `RUST_LOG=debug`, `RUST_LOG=oh_broker=trace,lapin=warn`

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format selected from `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Initialize logging for the given service.
///
/// Reads `LOG_FORMAT` to pick JSON or text output and `RUST_LOG` for filtering
/// (defaults to INFO). Safe to call more than once; later calls are ignored.
pub fn init_logging(service_name: &str) {
    let log_format = LogFormat::from_env_value(&std::env::var("LOG_FORMAT").unwrap_or_default());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match log_format {
        LogFormat::Json => init_json_logging(env_filter),
        LogFormat::Text => init_text_logging(env_filter),
    };

    if installed {
        tracing::debug!(service = %service_name, format = ?log_format, "Logging initialized");
    }
}

/// JSON logging for production/log aggregation.
fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE)
        )
        .try_init()
        .is_ok()
}

/// Human-readable logging for development.
fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true)
        )
        .try_init()
        .is_ok()
}
