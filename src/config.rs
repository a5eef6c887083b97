//! Run configuration.
//!
//! A [`ScanConfig`] is built once at startup from defaults, an optional TOML
//! file and command-line overrides, then shared read-only with every component.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ScanError};
use crate::state::Fingerprint;

pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_WORKERS: usize = 200;
pub const DEFAULT_MODEL_FILTER: &str = "deepseek-r1";
pub const DEFAULT_BANNER: &str = "Ollama is running";
pub const DEFAULT_BENCH_PROMPT: &str = "Why does the sun shine? Answer in one sentence.";
/// Consulted when no gateway identifier is configured.
pub const GATEWAY_ENV: &str = "GATEWAY_MAC";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Service port probed on every candidate.
    pub port: u16,
    /// Gateway identifier handed to the discovery tool (usually a MAC address).
    pub gateway: String,
    /// Candidate list, one address per line.
    pub input: PathBuf,
    /// CSV results file.
    pub output: PathBuf,
    /// Resumable scan state.
    pub state_file: PathBuf,
    pub bench_enabled: bool,
    pub bench_prompt: String,
    /// Substring a model identifier must contain to be reported. Empty accepts all.
    pub model_filter: String,
    /// Substring the root path must contain to identify the service.
    pub banner: String,
    pub workers: usize,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub bench_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    pub resume: bool,
    /// Print the overwritten progress line.
    pub show_progress: bool,
    /// Print a human-readable block per discovered host.
    pub print_results: bool,
    pub discovery: DiscoveryConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            gateway: String::new(),
            input: PathBuf::from("ip.txt"),
            output: PathBuf::from("results.csv"),
            state_file: PathBuf::from("scan_state.json"),
            bench_enabled: true,
            bench_prompt: DEFAULT_BENCH_PROMPT.to_string(),
            model_filter: DEFAULT_MODEL_FILTER.to_string(),
            banner: DEFAULT_BANNER.to_string(),
            workers: DEFAULT_WORKERS,
            probe_timeout: Duration::from_secs(3),
            bench_timeout: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(30),
            resume: false,
            show_progress: true,
            print_results: true,
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Which external tool turns address ranges into the candidate list.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryTool {
    /// Skip discovery and probe the existing candidate file.
    #[default]
    None,
    Zmap,
    Masscan,
    /// masscan on Windows, zmap elsewhere.
    Auto,
}

impl std::str::FromStr for DiscoveryTool {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(DiscoveryTool::None),
            "zmap" => Ok(DiscoveryTool::Zmap),
            "masscan" => Ok(DiscoveryTool::Masscan),
            "auto" => Ok(DiscoveryTool::Auto),
            _ => Err(format!(
                "invalid discovery tool '{s}', expected: none, zmap, masscan, auto"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub tool: DiscoveryTool,
    /// CIDR ranges (or single addresses) handed to the tool.
    pub ranges: PathBuf,
    pub zmap_threads: u32,
    pub masscan_rate: u32,
    pub interface: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            tool: DiscoveryTool::None,
            ranges: PathBuf::from("ranges.txt"),
            zmap_threads: 10,
            masscan_rate: 1000,
            interface: "eth0".to_string(),
        }
    }
}

impl ScanConfig {
    /// Load settings from a TOML file; absent keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScanError::io(format!("failed to read config {}", path.display()), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ScanError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ScanError::Config("port must be between 1 and 65535".into()));
        }
        if self.workers == 0 {
            return Err(ScanError::Config("workers must be at least 1".into()));
        }
        if self.probe_timeout.is_zero() || self.bench_timeout.is_zero() {
            return Err(ScanError::Config("timeouts must be greater than zero".into()));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ScanError::Config(
                "checkpoint_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Values that must match for a saved state to be resumed.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            gateway_identifier: self.gateway.clone(),
            input_path: self.input.clone(),
            output_path: self.output.clone(),
            benchmarking_enabled: self.bench_enabled,
        }
    }

    /// Bounded address queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.workers.saturating_mul(2).max(1)
    }

    pub fn accepts_model(&self, model: &str) -> bool {
        model.contains(self.model_filter.as_str())
    }

    /// Fill an empty `gateway` from `GATEWAY_MAC`, then from the hardware
    /// address of the discovery interface. Stays empty if neither is available.
    pub fn resolve_gateway(&mut self) {
        let interface = self.discovery.interface.clone();
        self.resolve_gateway_with(std::env::var(GATEWAY_ENV).ok(), || interface_mac(&interface));
    }

    fn resolve_gateway_with(&mut self, env: Option<String>, mac: impl FnOnce() -> Option<String>) {
        if !self.gateway.is_empty() {
            return;
        }
        if let Some(v) = env.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            tracing::info!(gateway = %v, "gateway taken from {GATEWAY_ENV}");
            self.gateway = v;
        } else if let Some(v) = mac() {
            tracing::info!(gateway = %v, interface = %self.discovery.interface, "gateway defaulted to interface MAC");
            self.gateway = v;
        }
    }
}

fn interface_mac(name: &str) -> Option<String> {
    match mac_address::mac_address_by_name(name) {
        Ok(Some(mac)) => Some(mac.to_string().to_lowercase()),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(interface = name, "MAC lookup failed: {e}");
            None
        }
    }
}
