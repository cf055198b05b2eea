//! Tracing initialization.
//!
//! Controlled by `RUST_LOG` (standard `EnvFilter` syntax) and
//! `STONEFORGE_LOG_FORMAT`:
//! - unset or `text` → compact human output on stderr
//! - `json` → one JSON event per line on stderr (for log shippers)
//!
//! Quiet by default: without `RUST_LOG` only warnings and errors surface.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Call once from `main()`;
/// repeated calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("STONEFORGE_LOG_FORMAT")
        .is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if result.is_err() {
        // A subscriber is already installed (tests, embedding callers).
        tracing::debug!("tracing subscriber already initialized");
    }
}
