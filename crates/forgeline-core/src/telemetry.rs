//! Subscriber setup for the `forgeline` binary and tests.
//!
//! Output always goes to stderr; stdout is reserved for run results. JSON
//! mode flattens event fields and carries the current `forgeline.run` span,
//! so every line of a run can be grouped by `run_id`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level`; a second
/// call is a no-op.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let text = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });
    let structured = json.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(structured)
        .try_init();
}

/// Our crates at `level`, everything else (HTTP stack included) at warn.
fn default_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    EnvFilter::new(format!("warn,forgeline_core={level},forgeline={level}"))
}
