//! Client configuration
//!
//! Every field has a default, so an empty or partial TOML file is valid.

use anyhow::{bail, Context};
use remoteled_shared::timing;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub link: LinkConfig,
    pub session: SessionConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse config as TOML")?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let nonzero = [
            ("backend.request_timeout_ms", self.backend.request_timeout_ms),
            ("link.scan_timeout_ms", self.link.scan_timeout_ms),
            ("link.connect_timeout_ms", self.link.connect_timeout_ms),
            ("link.max_queue_depth", self.link.max_queue_depth as u64),
            ("session.poll_interval_ms", self.session.poll_interval_ms),
            ("session.countdown_tick_ms", self.session.countdown_tick_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.backend.base_url.is_empty() {
            bail!("backend.base_url must be set");
        }
        Ok(())
    }
}

/// Backend REST service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, with trailing slash
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Path of the payment + trigger endpoint, relative to `base_url`
    pub payment_path: String,
    /// Ask the backend not to drive the LED itself
    pub skip_backend_led: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/".into(),
            request_timeout_ms: 10_000,
            payment_path: "payments/stripe/payment-and-trigger".into(),
            skip_backend_led: false,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Which link implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Real BLE peripheral through BlueZ
    #[default]
    Ble,
    /// In-process simulated peripheral (for development)
    Simulated,
}

/// Peripheral link and command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub mode: LinkMode,
    /// Adapter name (e.g. `hci0`), default adapter when unset
    pub adapter: Option<String>,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Delay between a write completion and the next transmission
    pub settle_delay_ms: u64,
    /// Retries after the first failed attempt
    pub max_write_retries: u32,
    pub max_queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Ble,
            adapter: None,
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            settle_delay_ms: timing::WRITE_SETTLE_DELAY_MS,
            max_write_retries: timing::WRITE_MAX_RETRIES,
            max_queue_depth: timing::MAX_QUEUE_DEPTH,
        }
    }
}

impl LinkConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Session timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub countdown_tick_ms: u64,
    /// Session length used for TRIGGER services
    pub trigger_countdown_secs: u32,
    /// How long teardown waits for queued commands to reach the peripheral
    pub drain_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: timing::POLL_INTERVAL_MS,
            countdown_tick_ms: timing::COUNTDOWN_TICK_MS,
            trigger_countdown_secs: timing::TRIGGER_SESSION_SECS,
            drain_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.backend.base_url, "http://127.0.0.1:8000/");
        assert_eq!(config.link.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.link.max_write_retries, 3);
        assert_eq!(config.session.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.session.countdown_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_partial_toml() {
        let toml_content = r#"
            [backend]
            base_url = "https://api.example.com/"

            [link]
            mode = "simulated"
            max_queue_depth = 4
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = ClientConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.backend.base_url, "https://api.example.com/");
        assert_eq!(config.backend.request_timeout_ms, 10_000);
        assert_eq!(config.link.mode, LinkMode::Simulated);
        assert_eq!(config.link.max_queue_depth, 4);
        assert_eq!(config.link.settle_delay_ms, 100);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_load_rejects_zero_intervals() {
        for (section, key) in [
            ("session", "countdown_tick_ms"),
            ("session", "poll_interval_ms"),
            ("link", "max_queue_depth"),
            ("backend", "request_timeout_ms"),
        ] {
            let mut temp_file = NamedTempFile::new().unwrap();
            write!(temp_file, "[{}]\n{} = 0\n", section, key).unwrap();

            let err = ClientConfig::load(temp_file.path()).unwrap_err();
            assert!(
                format!("{:#}", err).contains(&format!("{}.{} must be greater than zero", section, key)),
                "unexpected error for {}.{}: {:#}",
                section,
                key,
                err
            );
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClientConfig::load(Path::new("/nonexistent/remoteled.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[link\nmode = ").unwrap();
        assert!(ClientConfig::load(temp_file.path()).is_err());
    }
}
