//! Logging initialization.
//!
//! The level comes from `POLYAXON_LOG_LEVEL`, then `RUST_LOG`, then the
//! caller's default. A bare level (`debug`) applies to this crate only and
//! keeps dependencies at `warn`; a full filter directive is used as is.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log output settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Filter directive or bare level.
    pub level: String,
    /// Include module targets in each line.
    pub with_target: bool,
}

impl LogConfig {
    pub fn new(default_level: &str) -> Self {
        let level = std::env::var("POLYAXON_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| default_level.to_string());
        Self {
            level,
            with_target: true,
        }
    }

    /// The `EnvFilter` directive for `level`.
    pub fn directive(&self) -> String {
        let level = self.level.trim().to_lowercase();
        let bare = matches!(
            level.as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error" | "off"
        );
        if bare {
            let level = if level == "warning" { "warn".to_string() } else { level };
            format!("warn,polyflow={}", level)
        } else {
            self.level.clone()
        }
    }
}

/// Install the global subscriber. Safe to call twice; the second call is a no-op.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directive()).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(config.with_target)
                .with_filter(filter),
        )
        .try_init();
}
