// Logging setup shared by both binaries
//
// Output is JSON when running under systemd (which sets INVOCATION_ID) and
// human-readable with colors in a terminal.

use std::env;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

/// Picks the filter directive: `RUST_LOG` wins, then the configured level,
/// then `info`.
fn filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_LEVEL)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Initializes the global tracing subscriber.
///
/// # Arguments
/// * `level` - Configured log level or filter directive, e.g. `debug` or
///   `metrics_service=debug,sqlx=warn`
///
/// # Examples
/// ```bash
/// RUST_LOG=debug server ...   # overrides --log-level
/// ```
pub fn init_logging(level: Option<&str>) {
    let is_systemd = env::var("INVOCATION_ID").is_ok();
    let env_filter = filter(level);

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}

