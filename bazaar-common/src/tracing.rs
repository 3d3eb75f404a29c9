use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Default filter directive; overridden by `RUST_LOG` when set.
    pub level: String,
    pub json: bool,
    pub ansi: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            level: format!("info,{}=debug", service_name.replace('-', "_")),
            json: false,
            ansi: true,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            ansi: true,
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "level: {}", self.level);
        let _ = writeln!(&mut result, "json: {}", self.json);
        result
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level
/// so operators can raise verbosity without touching config files.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
