//! Diagnostic tracing for the taskloop binary.
//!
//! - **Tracing (this module)**: diagnostics on stderr. The run's `log_level`
//!   picks the default filter; `RUST_LOG` overrides it.
//! - **Run log (`io/run_log`)**: product output in `logs/run-{id}.log`.
//!   Always written, unaffected by either setting.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::io::run_state::{LogFormat, LogLevel};

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
///
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run
/// ```
pub fn init(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(false),
            )
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
