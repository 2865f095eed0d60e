//! Logging initialization
//!
//! `RUST_LOG` always wins; otherwise the filter from the config file is used,
//! and `info` when neither is set.
//!
//! ```rust,no_run
//! use modhost::utils::init_logging;
//!
//! init_logging(Some("modhost=debug"));
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "info";

/// Filter directive to use given the environment and an optional config value
fn filter_directive(env: Option<String>, filter: Option<&str>) -> String {
    env.filter(|e| !e.is_empty())
        .or_else(|| filter.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn env_filter(filter: Option<&str>) -> EnvFilter {
    let directive = filter_directive(std::env::var("RUST_LOG").ok(), filter);
    EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {:?} ({}), using {:?}", directive, e, DEFAULT_FILTER);
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Human-readable logging to stderr. A second call is a no-op.
pub fn init_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var_os("NO_COLOR").is_none()),
        )
        .with(env_filter(filter))
        .try_init();
}

/// JSON logging for log aggregation
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(env_filter(filter))
        .try_init();
}

/// Initialize logging from the `[logging]` config section
pub fn init_logging_from_config(config: Option<&LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map_or(false, |c| c.json_format) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            init_logging(filter);
            tracing::warn!("json_format requested but the json-logging feature is disabled");
        }
    } else {
        init_logging(filter);
    }
}
