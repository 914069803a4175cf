//! Tracing subscriber setup for applications embedding the social client.
//!
//! # Example
//!
//! ```rust,ignore
//! use kaos_social::telemetry::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::default().with_level("kaos_social=debug"));
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing configuration.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives (e.g. "info", "kaos_social=debug"). `RUST_LOG`
    /// takes precedence when set.
    pub log_level: String,
    /// Emit JSON lines for log aggregation.
    pub json_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_output: false,
        }
    }
}

impl TracingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json_output = true;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Install the global subscriber. False if one was already installed.
pub fn init_tracing(config: TracingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(config.filter());

    let installed = if config.json_output {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        registry.with(layer).try_init()
    } else {
        let layer = fmt::layer().with_target(true).compact();
        registry.with(layer).try_init()
    };

    installed.is_ok()
}
