//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agrisense_core::network::AddressRange;
use agrisense_core::{
    BleScanOptions, NetworkScanOptions, Permissions, PollerOptions, ProbeOptions, ScanPlan,
    SessionConfig,
};
use agrisense_types::{DEFAULT_HTTP_PATH, DEFAULT_HTTP_PORT, HttpTarget};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cli::DeviceArgs;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub wifi: WifiConfig,

    #[serde(default)]
    pub ble: BleConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub permissions: PermissionConfig,
}

/// `[wifi]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    /// Default sensor address
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Ranges swept after the built-in ones, as `a.b.c`
    #[serde(default)]
    pub ranges: Vec<String>,

    /// Probe the sensor's own access point address first
    #[serde(default = "default_true")]
    pub precheck: bool,
}

/// `[ble]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Default peripheral id
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,

    /// Only report peripherals whose name starts with this
    #[serde(default)]
    pub name_prefix: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// `[poll]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default)]
    pub simulate_on_zero: bool,

    #[serde(default = "default_zero_threshold")]
    pub zero_threshold: u32,
}

/// `[session]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_samples")]
    pub samples: usize,

    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

/// `[permissions]` section. Lets an operator forbid a transport outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default = "default_true")]
    pub network: bool,

    #[serde(default = "default_true")]
    pub bluetooth: bool,

    #[serde(default = "default_true")]
    pub location: bool,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_path() -> String {
    DEFAULT_HTTP_PATH.to_string()
}

fn default_probe_timeout_ms() -> u64 {
    agrisense_core::probe::DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_batch_size() -> usize {
    agrisense_core::network::DEFAULT_BATCH_SIZE
}

fn default_scan_secs() -> u64 {
    agrisense_core::ble::scan::DEFAULT_BLE_SCAN_DURATION.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_interval_secs() -> u64 {
    agrisense_core::poller::DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_zero_threshold() -> u32 {
    agrisense_core::poller::DEFAULT_ZERO_THRESHOLD
}

fn default_samples() -> usize {
    agrisense_core::session::DEFAULT_SAMPLE_COUNT
}

fn default_duration_secs() -> u64 {
    agrisense_core::session::DEFAULT_SESSION_DURATION.as_secs()
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            path: default_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
            batch_size: default_batch_size(),
            ranges: Vec::new(),
            precheck: true,
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device: None,
            scan_secs: default_scan_secs(),
            name_prefix: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            simulate_on_zero: false,
            zero_threshold: default_zero_threshold(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            duration_secs: default_duration_secs(),
        }
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            network: true,
            bluetooth: true,
            location: true,
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agrisense")
            .join("config.toml")
    }

    /// Load from `path` (or the default path). A missing or unreadable
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        match Self::load_from(&path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("{:#}", e);
                Self::default()
            }
        }
    }

    /// Load from an explicit path; `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(Some(config))
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn permissions(&self) -> Permissions {
        Permissions::new(
            self.permissions.network,
            self.permissions.bluetooth,
            self.permissions.location,
        )
    }

    pub fn probe_options(&self, timeout_ms: Option<u64>) -> ProbeOptions {
        ProbeOptions::new()
            .port(self.wifi.port)
            .path(self.wifi.path.clone())
            .timeout(Duration::from_millis(
                timeout_ms.unwrap_or(self.wifi.probe_timeout_ms),
            ))
    }

    /// Network scan options with flag overrides applied.
    pub fn network_scan_options(
        &self,
        batch_size: Option<usize>,
        timeout_ms: Option<u64>,
        extra_ranges: &[String],
    ) -> Result<NetworkScanOptions> {
        let mut plan = ScanPlan::default();
        if !self.wifi.precheck {
            plan.precheck = None;
        }
        for raw in self.wifi.ranges.iter().chain(extra_ranges) {
            let Some(range) = AddressRange::parse(raw) else {
                bail!("Invalid address range '{}', expected a.b.c", raw);
            };
            if !plan.ranges.contains(&range) {
                plan = plan.range(range);
            }
        }

        Ok(NetworkScanOptions::new()
            .batch_size(batch_size.unwrap_or(self.wifi.batch_size))
            .probe(self.probe_options(timeout_ms))
            .plan(plan))
    }

    pub fn ble_scan_options(&self, duration_secs: Option<u64>) -> BleScanOptions {
        let options = BleScanOptions::new()
            .duration(Duration::from_secs(duration_secs.unwrap_or(self.ble.scan_secs)));
        match &self.ble.name_prefix {
            Some(prefix) => options.name_prefix(prefix.clone()),
            None => options,
        }
    }

    pub fn poller_options(&self, interval_secs: Option<u64>, simulate: bool) -> PollerOptions {
        PollerOptions::new()
            .interval(Duration::from_secs(
                interval_secs.unwrap_or(self.poll.interval_secs),
            ))
            .simulate_on_zero(simulate || self.poll.simulate_on_zero)
            .zero_threshold(self.poll.zero_threshold)
    }

    pub fn session_config(
        &self,
        samples: Option<usize>,
        duration_secs: Option<u64>,
        simulate: bool,
    ) -> SessionConfig {
        SessionConfig::new()
            .target_sample_count(samples.unwrap_or(self.session.samples))
            .target_duration(Duration::from_secs(
                duration_secs.unwrap_or(self.session.duration_secs),
            ))
            .simulate_on_zero(simulate || self.poll.simulate_on_zero)
            .zero_threshold(self.poll.zero_threshold)
    }
}

/// A sensor picked from flags or config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChoice {
    Wifi(HttpTarget),
    Ble(String),
}

/// Resolve the device: `--wifi`, then `--ble`, then `[wifi] host`, then `[ble] device`.
pub fn resolve_device(args: &DeviceArgs, config: &Config) -> Result<DeviceChoice> {
    if let Some(host) = &args.wifi {
        return parse_wifi(host, config).map(DeviceChoice::Wifi);
    }
    if let Some(id) = &args.ble {
        return Ok(DeviceChoice::Ble(id.clone()));
    }
    if let Some(host) = &config.wifi.host {
        return parse_wifi(host, config).map(DeviceChoice::Wifi);
    }
    if let Some(id) = &config.ble.device {
        return Ok(DeviceChoice::Ble(id.clone()));
    }
    bail!("No device specified. Use --wifi HOST or --ble ID, or set one in the config file.")
}

/// Parse a WiFi address. The config port applies when the address has none.
fn parse_wifi(input: &str, config: &Config) -> Result<HttpTarget> {
    let Some(target) = HttpTarget::parse(input, &config.wifi.path) else {
        bail!("Invalid WiFi address '{}'", input);
    };
    let authority = input
        .trim()
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default();
    if authority.contains(':') {
        Ok(target)
    } else {
        Ok(target.with_port(config.wifi.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wifi_args(host: &str) -> DeviceArgs {
        DeviceArgs {
            wifi: Some(host.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.wifi.path, "/moisture");
        assert_eq!(config.session.samples, 10);
        assert_eq!(config.session.duration_secs, 5);
        assert_eq!(config.poll.interval_secs, 5);
        assert!(config.permissions.bluetooth);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [wifi]
            host = "192.168.4.1"
            batch_size = 20

            [permissions]
            bluetooth = false
            "#,
        )
        .unwrap();
        assert_eq!(config.wifi.host.as_deref(), Some("192.168.4.1"));
        assert_eq!(config.wifi.batch_size, 20);
        assert_eq!(config.wifi.port, 80);
        assert!(!config.permissions.bluetooth);
        assert!(config.permissions.network);
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.ble.device = Some("AA:BB:CC:DD:EE:FF".to_string());
        config.poll.simulate_on_zero = true;
        config.save(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[wifi\nhost = ").unwrap();
        assert!(Config::load_from(&path).is_err());
        assert_eq!(Config::load(Some(path.as_path())), Config::default());
    }

    #[test]
    fn test_resolve_device_prefers_flag() {
        let mut config = Config::default();
        config.wifi.host = Some("10.0.0.9".to_string());
        let choice = resolve_device(&wifi_args("10.0.0.2"), &config).unwrap();
        assert_eq!(choice, DeviceChoice::Wifi(HttpTarget::new("10.0.0.2")));
    }

    #[test]
    fn test_resolve_device_falls_back_to_config() {
        let mut config = Config::default();
        config.ble.device = Some("AA:BB".to_string());
        let choice = resolve_device(&DeviceArgs::default(), &config).unwrap();
        assert_eq!(choice, DeviceChoice::Ble("AA:BB".to_string()));
    }

    #[test]
    fn test_resolve_device_none_configured() {
        assert!(resolve_device(&DeviceArgs::default(), &Config::default()).is_err());
    }

    #[test]
    fn test_config_port_applies_without_explicit_port() {
        let mut config = Config::default();
        config.wifi.port = 8080;

        let DeviceChoice::Wifi(target) = resolve_device(&wifi_args("10.0.0.2"), &config).unwrap()
        else {
            panic!("expected wifi");
        };
        assert_eq!(target.port, 8080);

        let DeviceChoice::Wifi(target) =
            resolve_device(&wifi_args("10.0.0.2:9000"), &config).unwrap()
        else {
            panic!("expected wifi");
        };
        assert_eq!(target.port, 9000);
    }

    #[test]
    fn test_network_scan_options_merge_ranges() {
        let mut config = Config::default();
        config.wifi.ranges = vec!["10.1.1".to_string()];
        config.wifi.precheck = false;

        let options = config
            .network_scan_options(Some(4), None, &["10.1.2".to_string(), "10.1.1".to_string()])
            .unwrap();
        assert_eq!(options.batch_size, 4);
        assert!(options.plan.precheck.is_none());
        let extra: Vec<String> = options.plan.ranges.iter().map(|r| r.to_string()).collect();
        assert!(extra.ends_with(&["10.1.1.x".to_string(), "10.1.2.x".to_string()]));
    }

    #[test]
    fn test_network_scan_options_reject_bad_range() {
        let config = Config::default();
        assert!(
            config
                .network_scan_options(None, None, &["not-a-range".to_string()])
                .is_err()
        );
    }

    #[test]
    fn test_flag_overrides_session_config() {
        let config = Config::default();
        let session = config.session_config(Some(4), None, false);
        assert_eq!(session.target_sample_count, 4);
        assert_eq!(session.target_duration, Duration::from_secs(5));
        assert!(!session.simulate_on_zero);
        assert!(config.session_config(None, None, true).simulate_on_zero);
    }
}
