//! Logging setup.
//!
//! Everything logs through `tracing`. The subscriber writes to stderr so
//! command output on stdout stays parseable. `RUST_LOG` controls levels
//! (default `info`).

use std::sync::Once;

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Pretty,
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}
