//! Simulation settings.
//!
//! Settings describe how a page load is throttled and can be loaded from
//! YAML or JSON files.
//!
//! # Settings File Structure
//!
//! ```yaml
//! throttling_method: simulate
//! throttling:
//!   rtt_ms: 150
//!   throughput_kbps: 1638.4
//!   cpu_slowdown_multiplier: 4
//! maximum_concurrent_requests: 10
//! precomputed_lantern_data:
//!   additionalRttByOrigin:
//!     "https://example.com": 20
//!   serverResponseTimeByOrigin:
//!     "https://example.com": 80
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::network::analyzer::LanternData;

/// RTT observed under DevTools throttling is this factor above the real one.
pub const DEVTOOLS_RTT_ADJUSTMENT_FACTOR: f64 = 3.75;
/// Throughput observed under DevTools throttling is this factor of the real one.
pub const DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR: f64 = 0.9;

/// Errors that can occur during settings loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for settings operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How the page load was (or should be) throttled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlingMethod {
    /// Simulate the throttling numbers over an unthrottled load
    #[default]
    Simulate,
    /// The load was throttled by DevTools; undo its request-level adjustment
    Devtools,
    /// Use the observed network characteristics as-is
    Provided,
}

/// Throttling numbers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrottlingSettings {
    #[serde(default = "default_rtt_ms")]
    pub rtt_ms: f64,

    #[serde(default = "default_throughput_kbps")]
    pub throughput_kbps: f64,

    /// Request-level latency applied by DevTools
    #[serde(default = "default_request_latency_ms")]
    pub request_latency_ms: f64,

    #[serde(default = "default_download_throughput_kbps")]
    pub download_throughput_kbps: f64,

    #[serde(default = "default_cpu_slowdown_multiplier")]
    pub cpu_slowdown_multiplier: f64,
}

fn default_rtt_ms() -> f64 {
    150.0
}

fn default_throughput_kbps() -> f64 {
    1.6 * 1024.0
}

fn default_request_latency_ms() -> f64 {
    150.0 * DEVTOOLS_RTT_ADJUSTMENT_FACTOR
}

fn default_download_throughput_kbps() -> f64 {
    1.6 * 1024.0 * DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR
}

fn default_cpu_slowdown_multiplier() -> f64 {
    4.0
}

impl Default for ThrottlingSettings {
    /// Slow 4G on a mid-tier mobile device.
    fn default() -> Self {
        Self {
            rtt_ms: default_rtt_ms(),
            throughput_kbps: default_throughput_kbps(),
            request_latency_ms: default_request_latency_ms(),
            download_throughput_kbps: default_download_throughput_kbps(),
            cpu_slowdown_multiplier: default_cpu_slowdown_multiplier(),
        }
    }
}

/// Complete settings for building a simulator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LanternSettings {
    #[serde(default)]
    pub throttling_method: ThrottlingMethod,

    #[serde(default)]
    pub throttling: ThrottlingSettings,

    /// Overrides the default of 10 in-flight requests
    #[serde(default)]
    pub maximum_concurrent_requests: Option<usize>,

    /// Per-origin analysis saved from an earlier run, used instead of the
    /// observed one
    #[serde(default)]
    pub precomputed_lantern_data: Option<LanternData>,
}

impl LanternSettings {
    /// Creates the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let settings: LanternSettings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads settings from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let settings: LanternSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Checks that every throttling number the method uses is usable.
    ///
    /// Latencies and multipliers may be zero; throughputs must be positive.
    pub fn validate(&self) -> ConfigResult<()> {
        let t = &self.throttling;
        let (non_negative, positive): (&[(&str, f64)], &[(&str, f64)]) = match self.throttling_method {
            ThrottlingMethod::Simulate => (
                &[("rtt_ms", t.rtt_ms), ("cpu_slowdown_multiplier", t.cpu_slowdown_multiplier)],
                &[("throughput_kbps", t.throughput_kbps)],
            ),
            ThrottlingMethod::Devtools => (
                &[("request_latency_ms", t.request_latency_ms)],
                &[("download_throughput_kbps", t.download_throughput_kbps)],
            ),
            ThrottlingMethod::Provided => (&[], &[]),
        };
        for &(name, value) in non_negative {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        for &(name, value) in positive {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        if self.maximum_concurrent_requests == Some(0) {
            return Err(ConfigError::Validation(
                "maximum_concurrent_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves settings to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Builder for creating LanternSettings programmatically.
#[derive(Default)]
pub struct LanternSettingsBuilder {
    settings: LanternSettings,
}

impl LanternSettingsBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttling_method(mut self, method: ThrottlingMethod) -> Self {
        self.settings.throttling_method = method;
        self
    }

    pub fn rtt_ms(mut self, rtt: f64) -> Self {
        self.settings.throttling.rtt_ms = rtt;
        self
    }

    pub fn throughput_kbps(mut self, throughput: f64) -> Self {
        self.settings.throttling.throughput_kbps = throughput;
        self
    }

    pub fn request_latency_ms(mut self, latency: f64) -> Self {
        self.settings.throttling.request_latency_ms = latency;
        self
    }

    pub fn download_throughput_kbps(mut self, throughput: f64) -> Self {
        self.settings.throttling.download_throughput_kbps = throughput;
        self
    }

    pub fn cpu_slowdown_multiplier(mut self, multiplier: f64) -> Self {
        self.settings.throttling.cpu_slowdown_multiplier = multiplier;
        self
    }

    pub fn maximum_concurrent_requests(mut self, maximum: usize) -> Self {
        self.settings.maximum_concurrent_requests = Some(maximum);
        self
    }

    pub fn precomputed_lantern_data(mut self, data: LanternData) -> Self {
        self.settings.precomputed_lantern_data = Some(data);
        self
    }

    /// Builds and validates the settings.
    pub fn build(self) -> ConfigResult<LanternSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = LanternSettings::new();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Simulate);
        assert_eq!(settings.throttling.rtt_ms, 150.0);
        assert_eq!(settings.throttling.throughput_kbps, 1638.4);
        assert_eq!(settings.throttling.cpu_slowdown_multiplier, 4.0);
        assert!(settings.precomputed_lantern_data.is_none());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
throttling_method: devtools
throttling:
  request_latency_ms: 562.5
  download_throughput_kbps: 1474.56
maximum_concurrent_requests: 6
precomputed_lantern_data:
  additionalRttByOrigin:
    "https://a.test": 20
  serverResponseTimeByOrigin:
    "https://a.test": 80
"#;

        let settings = LanternSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Devtools);
        assert_eq!(settings.throttling.request_latency_ms, 562.5);
        // unspecified numbers keep their defaults
        assert_eq!(settings.throttling.rtt_ms, 150.0);
        assert_eq!(settings.maximum_concurrent_requests, Some(6));
        let data = settings.precomputed_lantern_data.unwrap();
        assert_eq!(data.server_response_time_by_origin["https://a.test"], 80.0);
    }

    #[test]
    fn test_json_parsing() {
        let json = r#"{
            "throttling_method": "provided",
            "throttling": {"cpu_slowdown_multiplier": 1}
        }"#;

        let settings = LanternSettings::from_json(json).unwrap();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Provided);
        assert_eq!(settings.throttling.cpu_slowdown_multiplier, 1.0);
    }

    #[test]
    fn test_builder() {
        let settings = LanternSettingsBuilder::new()
            .rtt_ms(40.0)
            .throughput_kbps(10.0 * 1024.0)
            .cpu_slowdown_multiplier(1.0)
            .maximum_concurrent_requests(4)
            .build()
            .unwrap();

        assert_eq!(settings.throttling.rtt_ms, 40.0);
        assert_eq!(settings.maximum_concurrent_requests, Some(4));
    }

    #[test]
    fn test_validation_negative_rtt() {
        let result = LanternSettingsBuilder::new().rtt_ms(-1.0).build();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_ignores_unused_numbers() {
        // devtools settings do not read rtt_ms
        let result = LanternSettingsBuilder::new()
            .throttling_method(ThrottlingMethod::Devtools)
            .rtt_ms(f64::NAN)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_validation_zero_throughput() {
        let result = LanternSettingsBuilder::new().throughput_kbps(0.0).build();
        assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("throughput_kbps")));

        let yaml = "throttling_method: devtools\nthrottling:\n  download_throughput_kbps: 0\n";
        assert!(matches!(LanternSettings::from_yaml(yaml), Err(ConfigError::Validation(_))));

        // simulate settings do not read the devtools throughput
        let unused = LanternSettingsBuilder::new().download_throughput_kbps(0.0).build();
        assert!(unused.is_ok());
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let yaml = "maximum_concurrent_requests: 0\n";
        assert!(LanternSettings::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_format() {
        let result = LanternSettings::from_file("settings.toml");
        assert!(matches!(result, Err(ConfigError::UnknownFormat(ext)) if ext == "toml"));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let settings = LanternSettingsBuilder::new()
            .throttling_method(ThrottlingMethod::Devtools)
            .request_latency_ms(300.0)
            .build()
            .unwrap();

        let yaml = settings.to_yaml().unwrap();
        let restored = LanternSettings::from_yaml(&yaml).unwrap();
        assert_eq!(settings, restored);
    }
}
