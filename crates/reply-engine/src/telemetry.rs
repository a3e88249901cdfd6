// reply-engine/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Engine logs at info, dependencies (reqwest, r2d2, ...) only at warn.
pub const DEFAULT_LOG_FILTER: &str = "warn,reply_engine=info";

/// `RUST_LOG` when set and non-empty, otherwise the engine default.
pub fn log_filter(rust_log: Option<String>) -> String {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

pub fn init_tracing() {
    let directives = log_filter(std::env::var("RUST_LOG").ok());
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Invalid RUST_LOG '{}': {}. Using '{}'.", directives, e, DEFAULT_LOG_FILTER);
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    // A second call keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
