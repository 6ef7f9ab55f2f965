//! Configuration loading and validation

use anyhow::{bail, Result};
use axon_core::{DiscriminatorConfig, TopicScheme};
use axon_rpc::CorrelatorConfig;
use axon_state::CacheConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub resolver: DiscriminatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the API server
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// `src` field of outgoing commands
    #[serde(default = "default_src")]
    pub src: String,
    /// `resp_to` field of outgoing commands
    #[serde(default = "default_resp_to")]
    pub resp_to: String,
    /// Seconds a command waits for its response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Command/event namespaces, `cmd_prefix` and `evt_prefix` keys
    #[serde(flatten)]
    pub topics: TopicScheme,
    /// Prefix of the per-device snapshot topics
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    /// Message type carrying full device state reports
    #[serde(default = "default_state_report_type")]
    pub state_report_type: String,
    /// Topic full device state reports arrive on
    #[serde(default = "default_state_report_topic")]
    pub state_report_topic: String,
    /// Seconds between full state requests (0 disables them)
    #[serde(default = "default_state_refresh")]
    pub state_refresh_secs: u64,
    /// Address of the controller service answering full state requests
    #[serde(default = "default_state_request_address")]
    pub state_request_address: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            src: default_src(),
            resp_to: default_resp_to(),
            request_timeout_secs: default_request_timeout(),
            topics: TopicScheme::default(),
            snapshot_prefix: default_snapshot_prefix(),
            state_report_type: default_state_report_type(),
            state_report_topic: default_state_report_topic(),
            state_refresh_secs: default_state_refresh(),
            state_request_address: default_state_request_address(),
        }
    }
}

fn default_src() -> String {
    "axon".to_string()
}

fn default_resp_to() -> String {
    "pt:j1/mt:rsp/rt:app/rn:axon/ad:1".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_snapshot_prefix() -> String {
    "axon/state".to_string()
}

fn default_state_report_type() -> String {
    "evt.pd7.response".to_string()
}

fn default_state_report_topic() -> String {
    "pt:j1/mt:rsp/rt:app/rn:axon/ad:1".to_string()
}

fn default_state_refresh() -> u64 {
    60 // Full snapshot rebuild every minute
}

fn default_state_request_address() -> String {
    "/rt:app/rn:vinculum/ad:1".to_string()
}

impl BridgeConfig {
    /// Topic a device's consolidated snapshot is published on
    pub fn snapshot_topic(&self, device_key: &str) -> String {
        format!("{}/{}/state", self.snapshot_prefix.trim_end_matches('/'), device_key)
    }
}

impl Config {
    /// Convert to CorrelatorConfig
    pub fn to_correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            source: self.bridge.src.clone(),
            response_topic: Some(self.bridge.resp_to.clone()),
            default_timeout: Duration::from_secs(self.bridge.request_timeout_secs),
            topics: self.bridge.topics.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.bridge.request_timeout_secs == 0 {
            bail!("bridge.request_timeout_secs must be greater than zero");
        }
        if self.bridge.topics.cmd_prefix == self.bridge.topics.evt_prefix {
            bail!("bridge.cmd_prefix and bridge.evt_prefix must differ");
        }
        if self.resolver.default_field.is_empty() {
            bail!("resolver.default_field must not be empty");
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::DiscriminatorRule;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/axon.toml")).unwrap();
        assert_eq!(config.daemon.bind, "0.0.0.0:8080");
        assert_eq!(config.bridge.request_timeout_secs, 10);
        assert_eq!(config.bridge.topics, TopicScheme::default());
        assert!(config.cache.excluded_attributes.contains("meter_ext"));
        assert_eq!(
            config.resolver.rule_for("alarm"),
            DiscriminatorRule::Field("event".to_string())
        );
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[bridge]
request_timeout_secs = 3
evt_prefix = "test/evt"

[cache]
excluded_attributes = ["meter_ext", "meter_export"]

[resolver]
default_field = "kind"

[resolver.overrides]
alarm = {{ field = "event" }}
config = {{ identity = "parameter_id" }}
mode = "none"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.bridge.request_timeout_secs, 3);
        assert_eq!(config.bridge.topics.evt_prefix, "test/evt");
        assert_eq!(config.bridge.topics.cmd_prefix, "pt:j1/mt:cmd");
        assert_eq!(config.cache.excluded_attributes.len(), 2);
        assert_eq!(config.resolver.rule_for("mode"), DiscriminatorRule::None);
        assert_eq!(
            config.resolver.rule_for("lvl"),
            DiscriminatorRule::Field("kind".to_string())
        );
        assert_eq!(
            config.to_correlator_config().default_timeout,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[bridge]\nrequest_timeout_secs = 0\n").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_snapshot_topic() {
        let bridge = BridgeConfig::default();
        assert_eq!(bridge.snapshot_topic("12"), "axon/state/12/state");
    }
}
