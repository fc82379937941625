//! Provisioner settings.
//!
//! Every module-level constant of the pipeline (directories, tower
//! networks, sizing policy, retry budgets) lives here so callers and
//! tests can override paths without touching process-wide state. Defaults
//! can be overlaid from a small TOML file.

use anyhow::Context;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::network::Subnet;

const MIB: u64 = 1024 * 1024;

/// Runtime configuration for one provisioning session.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Tower state directory: host records under `hosts/`, keypairs under
    /// `ssh/`.
    pub config_dir: PathBuf,
    /// Session working directory; its existence is the concurrency guard.
    pub work_dir: PathBuf,
    /// Artifact cache override. When unset, resolution falls back to
    /// `./dist`, `./builds`, then the user cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Login user created on every host.
    pub default_user: String,
    /// The host acting as network gateway.
    pub router_hostname: String,
    pub router_ip: Ipv4Addr,
    pub network_online: Subnet,
    pub network_offline: Subnet,
    pub thin_client_ip_online: Ipv4Addr,
    pub thin_client_ip_offline: Ipv4Addr,
    /// Host addresses below this offset are reserved.
    pub first_host_offset: u32,

    /// Partition sizing policy, fed to the planner.
    pub boot_size: u64,
    pub alignment: u64,
    pub margin_fraction: f64,
    pub margin_floor: u64,

    /// Loop acquisition: one attempt plus this many retries.
    pub loop_attach_attempts: u32,
    pub loop_retry_delay: Duration,

    pub discovery_poll_interval: Duration,
    pub discovery_max_wait: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir: home.join(".tower"),
            work_dir: std::env::temp_dir().join("tower-provision-work"),
            cache_dir: None,
            default_user: "tower".to_string(),
            router_hostname: "router".to_string(),
            router_ip: Ipv4Addr::new(10, 20, 0, 254),
            network_online: Subnet::new(Ipv4Addr::new(10, 20, 0, 0), 24).unwrap(),
            network_offline: Subnet::new(Ipv4Addr::new(10, 10, 0, 0), 24).unwrap(),
            thin_client_ip_online: Ipv4Addr::new(10, 20, 0, 1),
            thin_client_ip_offline: Ipv4Addr::new(10, 10, 0, 1),
            first_host_offset: 2,
            boot_size: 256 * MIB,
            alignment: 4 * MIB,
            margin_fraction: 0.2,
            margin_floor: 200 * MIB,
            loop_attach_attempts: 5,
            loop_retry_delay: Duration::from_secs(5),
            discovery_poll_interval: Duration::from_secs(10),
            discovery_max_wait: Duration::from_secs(300),
        }
    }
}

/// On-disk override file. Every field is optional; absent fields keep
/// their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    config_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    default_user: Option<String>,
    router_hostname: Option<String>,
    router_ip: Option<String>,
    network_online: Option<String>,
    network_offline: Option<String>,
    thin_client_ip_online: Option<String>,
    thin_client_ip_offline: Option<String>,
    first_host_offset: Option<u32>,
    boot_size_mib: Option<u64>,
    alignment_mib: Option<u64>,
    margin_fraction: Option<f64>,
    margin_floor_mib: Option<u64>,
    loop_attach_attempts: Option<u32>,
    loop_retry_delay_secs: Option<u64>,
    discovery_poll_interval_secs: Option<u64>,
    discovery_max_wait_secs: Option<u64>,
}

impl Settings {
    /// Defaults overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = Settings::default();
        let Some(path) = path else {
            return Ok(settings);
        };

        let raw = std::fs::read_to_string(path)?;
        let parsed: SettingsToml = toml::from_str(&raw)
            .with_context(|| format!("parsing settings file '{}'", path.display()))
            .map_err(Error::Command)?;
        settings.apply(parsed, path)?;
        Ok(settings)
    }

    fn apply(&mut self, toml: SettingsToml, path: &Path) -> Result<()> {
        fn parse<T: std::str::FromStr>(path: &Path, field: &str, raw: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.parse().map_err(|e| {
                Error::Command(anyhow::anyhow!(
                    "invalid {} in '{}': {}",
                    field,
                    path.display(),
                    e
                ))
            })
        }

        if let Some(v) = toml.config_dir {
            self.config_dir = v;
        }
        if let Some(v) = toml.work_dir {
            self.work_dir = v;
        }
        if let Some(v) = toml.cache_dir {
            self.cache_dir = Some(v);
        }
        if let Some(v) = toml.default_user {
            self.default_user = v;
        }
        if let Some(v) = toml.router_hostname {
            self.router_hostname = v;
        }
        if let Some(v) = toml.router_ip {
            self.router_ip = parse(path, "router_ip", &v)?;
        }
        if let Some(v) = toml.network_online {
            self.network_online = parse(path, "network_online", &v)?;
        }
        if let Some(v) = toml.network_offline {
            self.network_offline = parse(path, "network_offline", &v)?;
        }
        if let Some(v) = toml.thin_client_ip_online {
            self.thin_client_ip_online = parse(path, "thin_client_ip_online", &v)?;
        }
        if let Some(v) = toml.thin_client_ip_offline {
            self.thin_client_ip_offline = parse(path, "thin_client_ip_offline", &v)?;
        }
        if let Some(v) = toml.first_host_offset {
            self.first_host_offset = v;
        }
        if let Some(v) = toml.boot_size_mib {
            self.boot_size = v * MIB;
        }
        if let Some(v) = toml.alignment_mib {
            self.alignment = v * MIB;
        }
        if let Some(v) = toml.margin_fraction {
            self.margin_fraction = v;
        }
        if let Some(v) = toml.margin_floor_mib {
            self.margin_floor = v * MIB;
        }
        if let Some(v) = toml.loop_attach_attempts {
            self.loop_attach_attempts = v.max(1);
        }
        if let Some(v) = toml.loop_retry_delay_secs {
            self.loop_retry_delay = Duration::from_secs(v);
        }
        if let Some(v) = toml.discovery_poll_interval_secs {
            self.discovery_poll_interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = toml.discovery_max_wait_secs {
            self.discovery_max_wait = Duration::from_secs(v);
        }
        Ok(())
    }
}
