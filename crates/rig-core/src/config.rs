//! Controller configuration, loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub timeouts: TimeoutConfig,
    pub telemetry: TelemetryConfig,
    pub store: StoreConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            telemetry: TelemetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-call budget for management client calls.
    #[serde(with = "humantime_serde")]
    pub management_call: Duration,
    /// Grace window for finalizer drains.
    #[serde(with = "humantime_serde")]
    pub finalizer_grace: Duration,
    /// Requeue delay after a status write conflict.
    #[serde(with = "humantime_serde")]
    pub conflict_backoff: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            management_call: Duration::from_secs(10),
            finalizer_grace: Duration::from_secs(30),
            conflict_backoff: Duration::from_secs(1),
        }
    }
}

/// Templates materialized as the telemetry overlay when a referenced service
/// template declares telemetry agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub prometheus_template: String,
    pub grafana_template: String,
    pub dataviewer_template: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_template: "observability/prometheus".to_string(),
            grafana_template: "observability/grafana".to_string(),
            dataviewer_template: "observability/dataviewer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from(".rig/state.sqlite"),
        }
    }
}

pub fn parse_config(contents: &str) -> Result<ControllerConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ControllerConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").expect("parse empty config");
        assert_eq!(config.timeouts.management_call, Duration::from_secs(10));
        assert_eq!(config.timeouts.finalizer_grace, Duration::from_secs(30));
        assert_eq!(config.store.sqlite_path, PathBuf::from(".rig/state.sqlite"));
    }

    #[test]
    fn durations_parse_from_humantime_strings() {
        let config = parse_config(
            r#"
[timeouts]
management_call = "5s"
finalizer_grace = "1m"
conflict_backoff = "250ms"
"#,
        )
        .expect("parse config");

        assert_eq!(config.timeouts.management_call, Duration::from_secs(5));
        assert_eq!(config.timeouts.finalizer_grace, Duration::from_secs(60));
        assert_eq!(config.timeouts.conflict_backoff, Duration::from_millis(250));
    }

    #[test]
    fn telemetry_templates_are_overridable() {
        let config = parse_config(
            r#"
[telemetry]
prometheus_template = "custom/prom"
"#,
        )
        .expect("parse config");

        assert_eq!(config.telemetry.prometheus_template, "custom/prom");
        assert_eq!(
            config.telemetry.grafana_template,
            "observability/grafana"
        );
    }
}
