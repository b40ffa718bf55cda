use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;
use crate::profile::{CHIP_FAMILY_KEY, MODEL_KEY, VERSION_KEY};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level for the binary (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Plan executor timeouts
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Safety monitor indicators
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Attributes queried when profiling a target
    #[serde(default)]
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_stage_timeout")]
    pub rollback_timeout_secs: u64,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
}

impl ExecutorConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout(),
            rollback_timeout_secs: default_stage_timeout(),
            verify_timeout_secs: default_verify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_indicators")]
    pub indicators: Vec<IndicatorConfig>,
}

impl MonitorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout(),
            indicators: default_indicators(),
        }
    }
}

/// One defensive indicator: an attribute read from the target and the rule
/// that turns its value into a named flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub flag: String,
    pub attribute: String,
    #[serde(rename = "match")]
    pub matcher: SignalMatch,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SignalMatch {
    /// Trimmed value equals the expected text
    Equals(String),
    /// Value contains the needle, case-insensitive
    Contains(String),
}

impl SignalMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            SignalMatch::Equals(expected) => value.trim() == expected,
            SignalMatch::Contains(needle) => {
                value.to_lowercase().contains(&needle.to_lowercase())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_attribute_keys")]
    pub attribute_keys: Vec<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            attribute_keys: default_attribute_keys(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stage_timeout() -> u64 {
    120
}

fn default_verify_timeout() -> u64 {
    60
}

fn default_query_timeout() -> u64 {
    30
}

fn default_indicators() -> Vec<IndicatorConfig> {
    vec![
        IndicatorConfig {
            flag: "measurement-active".to_string(),
            attribute: "signal.measurement".to_string(),
            matcher: SignalMatch::Contains("measurement_active".to_string()),
            severity: Severity::Critical,
        },
        IndicatorConfig {
            flag: "tamper-counter".to_string(),
            attribute: "signal.tamper-counter".to_string(),
            matcher: SignalMatch::Equals("1".to_string()),
            severity: Severity::Critical,
        },
        IndicatorConfig {
            flag: "integrity-violation".to_string(),
            attribute: "signal.integrity-log".to_string(),
            matcher: SignalMatch::Contains("violation".to_string()),
            severity: Severity::High,
        },
        IndicatorConfig {
            flag: "verification-error".to_string(),
            attribute: "signal.verification".to_string(),
            matcher: SignalMatch::Contains("error".to_string()),
            severity: Severity::High,
        },
    ]
}

fn default_attribute_keys() -> Vec<String> {
    [
        MODEL_KEY,
        VERSION_KEY,
        CHIP_FAMILY_KEY,
        "root-present",
        "bootloader-locked",
        "enforcement-mode",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            executor: ExecutorConfig::default(),
            monitor: MonitorConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(
            indicators = config.monitor.indicators.len(),
            stage_timeout_secs = config.executor.stage_timeout_secs,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
