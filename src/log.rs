//! Structured logging for constellation.
//!
//! Log levels:
//! - ERROR: Failures that abort a command
//! - WARN: Unexpected conditions that are recoverable (late signals, failed undo)
//! - INFO: Graph lifecycle (execution start, terminal state)
//! - DEBUG: Per-task dispatch and transition traces
//! - TRACE: Event publication
//!
//! Debug mode can be enabled with `--debug` flag or `CONSTELLATION_DEBUG=1`.
//! `CONSTELLATION_LOG` takes a full filter directive (e.g.
//! `constellation::orchestration=trace`) and wins over both.
//! Output goes to stderr so command output on stdout stays parseable.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CONSTELLATION_LOG";
const DEBUG_ENV: &str = "CONSTELLATION_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Calling it a second time (e.g. from tests) leaves the first
/// subscriber in place.
pub fn init_with_debug(debug: bool) {
    let filter = build_filter(debug, std::env::var(LOG_ENV).ok(), env_debug());
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn build_filter(debug: bool, directive: Option<String>, env_debug: bool) -> EnvFilter {
    let fallback = default_directive(debug || env_debug);
    match directive {
        Some(directive) => {
            EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(fallback))
        }
        None => EnvFilter::new(fallback),
    }
}
