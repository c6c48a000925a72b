//! Shared tracing/logging initialization.
//!
//! The daemon and its client subcommands use the same pattern for setting up
//! `tracing_subscriber` with an env-filter and optional JSON output. Both
//! formats go to stderr; stdout is reserved for command output.

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"devtunnel_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into());
    build_subscriber(&filter, log_json, std::io::stderr).init();
}

/// Build a subscriber writing through `writer` with the given filter.
fn build_subscriber<W>(
    filter: &str,
    log_json: bool,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(EnvFilter::new(filter));
    if log_json {
        Box::new(registry.with(tracing_subscriber::fmt::layer().json().with_writer(writer)))
    } else {
        Box::new(registry.with(tracing_subscriber::fmt::layer().with_writer(writer)))
    }
}
