//! Structured logging setup, ported from the platform's shared logging
//! bootstrap: `RUST_LOG` drives the filter, `LOG_FORMAT` picks the
//! formatter (`json` in production, human-readable ANSI text otherwise).

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Install a global `tracing` subscriber for `service_name`. Call once, at
/// process startup. Reads `RUST_LOG` for the filter (defaulting to `info`)
/// and `LOG_FORMAT=json|text` to choose the formatter.
pub fn init_logging(service_name: &str) {
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => init_json_logging(service_name),
        _ => init_text_logging(service_name),
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_json_logging(service_name: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_filter(env_filter());

    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    tracing::info!(service = service_name, format = "json", "logging initialized");
}

pub fn init_text_logging(service_name: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_filter(env_filter());

    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    tracing::info!(service = service_name, format = "text", "logging initialized");
}

/// Convenience for tests and examples that don't care about the format.
pub fn init_default_logging() {
    init_logging("notify-queue");
}
