//! Configuration types for servicekeel.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::{ControllerSettings, MetadataPolicy, MAX_WATCHED_SERVICES};
use crate::error::SidecarError;
use crate::handler::MAX_TTL;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DNS resolver configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Reconciliation controller configuration.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Desired-state source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Tunnel process configuration.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Reject configurations the sidecar cannot start with.
    pub fn validate(&self) -> Result<(), SidecarError> {
        let services = &self.controller.watch_list;
        if services.is_empty() {
            return Err(SidecarError::Config("controller.watch_list is empty".to_string()));
        }
        if services.len() > MAX_WATCHED_SERVICES {
            return Err(SidecarError::Config(format!(
                "controller.watch_list has {} entries, at most {MAX_WATCHED_SERVICES} allowed",
                services.len()
            )));
        }
        if services.iter().any(|s| s.trim().is_empty()) {
            return Err(SidecarError::Config("controller.watch_list contains an empty name".to_string()));
        }
        if self.controller.interval_secs == 0 {
            return Err(SidecarError::Config("controller.interval_secs must be positive".to_string()));
        }
        if self.dns.ttl == 0 || self.dns.ttl > MAX_TTL {
            return Err(SidecarError::Config(format!(
                "dns.ttl must be between 1 and {MAX_TTL} seconds, got {}",
                self.dns.ttl
            )));
        }
        if self.dns.ip_range.trim().is_empty() {
            return Err(SidecarError::Config("dns.ip_range is empty".to_string()));
        }
        self.dns
            .ip_range
            .trim()
            .parse::<ipnet::Ipv4Net>()
            .map_err(|e| SidecarError::InvalidAddressRange {
                range: self.dns.ip_range.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

/// DNS resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// CIDR the virtual IPs are drawn from.
    #[serde(default = "default_ip_range")]
    pub ip_range: String,

    /// Search domains, most specific first.
    #[serde(default)]
    pub search_domains: Vec<String>,

    /// Load search domains from `resolv_conf_path` when `search_domains` is empty.
    #[serde(default)]
    pub use_resolv_conf: bool,

    /// Path of the resolver configuration file.
    #[serde(default = "default_resolv_conf_path")]
    pub resolv_conf_path: PathBuf,

    /// TTL for hijacked answers in seconds (1 to 9).
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ip_range: default_ip_range(),
            search_domains: Vec::new(),
            use_resolv_conf: false,
            resolv_conf_path: default_resolv_conf_path(),
            ttl: default_ttl(),
        }
    }
}

impl DnsConfig {
    /// Effective search domains: explicit ones, else resolv.conf if enabled.
    pub fn effective_search_domains(&self) -> Result<Vec<String>, SidecarError> {
        if !self.search_domains.is_empty() || !self.use_resolv_conf {
            return Ok(self.search_domains.clone());
        }
        load_resolv_conf_search(&self.resolv_conf_path)
    }
}

/// Reconciliation controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Service names to reconcile.
    #[serde(default)]
    pub watch_list: Vec<String>,

    /// Seconds between cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Behaviour when a running endpoint's descriptor changes.
    #[serde(default)]
    pub on_metadata_change: MetadataPolicy,

    /// Domains under which each service name is also aliased.
    #[serde(default)]
    pub alias_suffixes: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_list: Vec::new(),
            interval_secs: default_interval_secs(),
            on_metadata_change: MetadataPolicy::default(),
            alias_suffixes: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Settings for a controller named `name`.
    pub fn settings(&self, name: &str) -> ControllerSettings {
        ControllerSettings {
            name: name.to_string(),
            watch_list: self.watch_list.clone(),
            interval: Duration::from_secs(self.interval_secs),
            metadata_policy: self.on_metadata_change,
            alias_suffixes: self.alias_suffixes.clone(),
        }
    }
}

/// Desired-state source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// File listing the desired entries (TOML, JSON or YAML).
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
        }
    }
}

/// Tunnel process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel client binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Tunnel server port used when an entry does not specify one.
    #[serde(default = "default_server_port")]
    pub default_server_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            default_server_port: default_server_port(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "servicekeel=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

/// Parse the `search` lines of a resolv.conf file, in order.
pub fn parse_resolv_conf_search(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next() == Some("search")).then_some(fields)
        })
        .flatten()
        .map(str::to_string)
        .collect()
}

/// Read search domains from a resolv.conf file.
pub fn load_resolv_conf_search(path: &Path) -> Result<Vec<String>, SidecarError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        SidecarError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    Ok(parse_resolv_conf_search(&contents))
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 2], 53))
}

fn default_ip_range() -> String {
    "127.0.66.0/24".to_string()
}

fn default_resolv_conf_path() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_ttl() -> u32 {
    crate::handler::DEFAULT_TTL
}

fn default_interval_secs() -> u64 {
    10
}

fn default_source_path() -> PathBuf {
    PathBuf::from("endpoints.toml")
}

fn default_binary() -> PathBuf {
    PathBuf::from("frpc")
}

fn default_server_port() -> u16 {
    7000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "servicekeel".to_string()
}
