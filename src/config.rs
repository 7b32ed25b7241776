//! Session configuration.
//!
//! Every knob has a default matching the button firmware, so an empty TOML
//! document is a valid configuration. Durations are written in milliseconds:
//!
//! ```toml
//! scan_timeout_ms = 15000
//! simulated_send = false
//! platform = "android"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{defaults, uuids};
use crate::error::ConfigError;
use crate::permission::Platform;
use crate::retry::RetryPolicy;
use crate::scanner::ScanConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service carrying the button characteristic.
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,

    /// Surface only devices whose name starts with this prefix.
    pub name_prefix: Option<String>,

    /// Ask the radio for devices advertising `service_uuid` only. Buttons
    /// with firmware that does not advertise the service need this off.
    pub filter_by_service: bool,

    #[serde(rename = "scan_timeout_ms", with = "millis_serde")]
    pub scan_timeout: Duration,

    #[serde(rename = "connect_timeout_ms", with = "millis_serde")]
    pub connect_timeout: Duration,

    /// Wait after constructing the adapter before using it.
    #[serde(rename = "adapter_settle_ms", with = "millis_serde")]
    pub adapter_settle: Duration,

    /// Wait between connecting and subscribing.
    #[serde(rename = "monitor_delay_ms", with = "millis_serde")]
    pub monitor_delay: Duration,

    pub adapter_max_attempts: u32,

    #[serde(rename = "adapter_retry_backoff_ms", with = "millis_serde")]
    pub adapter_retry_backoff: Duration,

    pub scan_max_attempts: u32,

    #[serde(rename = "scan_retry_backoff_ms", with = "millis_serde")]
    pub scan_retry_backoff: Duration,

    /// Log alerts instead of sending them; messaging permission is not needed.
    pub simulated_send: bool,

    pub platform: Platform,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: uuids::BUTTON_SERVICE,
            characteristic_uuid: uuids::BUTTON_CHARACTERISTIC,
            name_prefix: None,
            filter_by_service: true,
            scan_timeout: defaults::SCAN_TIMEOUT,
            connect_timeout: defaults::CONNECT_TIMEOUT,
            adapter_settle: defaults::ADAPTER_SETTLE,
            monitor_delay: defaults::MONITOR_DELAY,
            adapter_max_attempts: defaults::MAX_ADAPTER_ATTEMPTS,
            adapter_retry_backoff: defaults::RETRY_BACKOFF,
            scan_max_attempts: defaults::MAX_SCAN_ATTEMPTS,
            scan_retry_backoff: defaults::RETRY_BACKOFF,
            simulated_send: true,
            platform: Platform::current(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Store(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Characteristic to monitor
    pub fn button(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service_uuid = service;
        self.characteristic_uuid = characteristic;
        self
    }

    /// Surface only devices whose name starts with `prefix`
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn filter_by_service(mut self, filter: bool) -> Self {
        self.filter_by_service = filter;
        self
    }

    /// Stop scans after given duration
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Give up connecting after given duration
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn adapter_settle(mut self, settle: Duration) -> Self {
        self.adapter_settle = settle;
        self
    }

    pub fn monitor_delay(mut self, delay: Duration) -> Self {
        self.monitor_delay = delay;
        self
    }

    pub fn adapter_retry(mut self, policy: RetryPolicy) -> Self {
        self.adapter_max_attempts = policy.max_attempts;
        self.adapter_retry_backoff = policy.backoff;
        self
    }

    pub fn scan_retry(mut self, policy: RetryPolicy) -> Self {
        self.scan_max_attempts = policy.max_attempts;
        self.scan_retry_backoff = policy.backoff;
        self
    }

    pub fn simulated_send(mut self, simulated: bool) -> Self {
        self.simulated_send = simulated;
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn adapter_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.adapter_max_attempts, self.adapter_retry_backoff)
    }

    pub fn scan_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.scan_max_attempts, self.scan_retry_backoff)
    }

    /// Scan settings for discovering button peripherals.
    pub fn scan_config(&self) -> ScanConfig {
        let mut config = ScanConfig::default()
            .stop_after_timeout(self.scan_timeout)
            .require_name();

        if self.filter_by_service {
            config = config.filter_by_services([self.service_uuid]);
        }

        match &self.name_prefix {
            Some(prefix) => config.filter_by_name_prefix(prefix.clone()),
            None => config,
        }
    }
}

mod millis_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.service_uuid.to_string(), "12345678-1234-1234-1234-1234567890ab");
        assert_eq!(
            config.characteristic_uuid.to_string(),
            "abcd1234-5678-90ab-cdef-1234567890ab"
        );
        assert_eq!(config.scan_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.adapter_settle, Duration::from_secs(2));
        assert_eq!(config.monitor_delay, Duration::from_secs(1));
        assert_eq!(config.adapter_retry_policy().max_attempts, 3);
        assert_eq!(config.scan_retry_policy().backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_scan_filters_by_button_service() {
        let config = SessionConfig::default();
        assert_eq!(config.scan_config().services(), &[uuids::BUTTON_SERVICE]);

        let config = SessionConfig::default().filter_by_service(false);
        assert!(config.scan_config().services().is_empty());

        let config = SessionConfig::from_toml_str("filter_by_service = false").unwrap();
        assert!(!config.filter_by_service);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SessionConfig::from_toml_str("").unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_toml_overrides() {
        let config = SessionConfig::from_toml_str(
            r#"
            scan_timeout_ms = 15000
            monitor_delay_ms = 0
            adapter_max_attempts = 5
            simulated_send = false
            platform = "android"
            service_uuid = "0000180f-0000-1000-8000-00805f9b34fb"
            "#,
        )
        .unwrap();

        assert_eq!(config.scan_timeout, Duration::from_secs(15));
        assert_eq!(config.monitor_delay, Duration::ZERO);
        assert_eq!(config.adapter_max_attempts, 5);
        assert!(!config.simulated_send);
        assert_eq!(config.platform, Platform::Android);
        assert_eq!(config.service_uuid, Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb));
        assert_eq!(config.connect_timeout, defaults::CONNECT_TIMEOUT);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            SessionConfig::from_toml_str("scan_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let config = SessionConfig::default()
            .scan_timeout(Duration::from_millis(2500))
            .name_prefix("ESP32")
            .platform(Platform::Ios);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes()).unwrap();

        assert_eq!(SessionConfig::from_toml_file(file.path()).unwrap(), config);
        assert!(matches!(
            SessionConfig::from_toml_file("/nonexistent/blealert.toml"),
            Err(ConfigError::Store(_))
        ));
    }
}
