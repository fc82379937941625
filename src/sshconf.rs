//! The host registry: persisted per-host records and the SSH client
//! configuration that makes `ssh <name>` work after provisioning.
//!
//! Records live at `<config_dir>/hosts/<name>.env`, keypairs at
//! `<config_dir>/ssh/<name>[.pub]`, and the managed SSH configuration at
//! `<config_dir>/ssh/config`. The SSH config is rewritten block-wise: the
//! `Host <name>` block is replaced on rediscovery, everything else is
//! left untouched.

use std::collections::BTreeSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hostcfg::HostConfig;

#[derive(Debug, Clone)]
pub struct Registry {
    config_dir: PathBuf,
}

/// One row of the `status` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub ip: String,
    pub online: bool,
}

impl Registry {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.config_dir.join("hosts")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.config_dir.join("ssh")
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.hosts_dir().join(format!("{name}.env"))
    }

    pub fn private_key_path(&self, name: &str) -> PathBuf {
        self.ssh_dir().join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).is_file()
    }

    /// Persist a host record, owner read/write only.
    pub fn save_record(&self, config: &HostConfig) -> Result<()> {
        let path = self.record_path(&config.hostname);
        log::info!("saving host configuration in {}...", path.display());
        config.save(&path)
    }

    pub fn load_record(&self, name: &str) -> Result<HostConfig> {
        HostConfig::load(&self.record_path(name))
    }

    /// Every static host address currently assigned in the registry.
    pub fn taken_ips(&self) -> BTreeSet<Ipv4Addr> {
        let mut taken = BTreeSet::new();
        let Ok(entries) = fs::read_dir(self.hosts_dir()) else {
            return taken;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("env") {
                continue;
            }
            if let Ok(config) = HostConfig::load(&path) {
                if let Ok(ip) = config.static_host_ip.parse() {
                    taken.insert(ip);
                }
            }
        }
        taken
    }

    /// All registered hosts, for the `status` listing.
    pub fn hosts(&self) -> Vec<HostEntry> {
        let mut hosts = Vec::new();
        let Ok(entries) = fs::read_dir(self.hosts_dir()) else {
            return hosts;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("env") {
                continue;
            }
            if let Ok(config) = HostConfig::load(&path) {
                hosts.push(HostEntry {
                    name: config.hostname,
                    ip: config.static_host_ip,
                    online: config.online,
                });
            }
        }
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    /// Insert or replace the managed `Host <name>` block in the SSH
    /// client configuration.
    pub fn update_ssh_config(&self, name: &str, ip: &str, user: &str, key_path: &Path) -> Result<()> {
        let config_path = self.ssh_dir().join("config");
        let existing = fs::read_to_string(&config_path).unwrap_or_default();

        let mut kept: Vec<&str> = Vec::new();
        let mut in_target_block = false;
        for line in existing.lines() {
            let trimmed = line.trim();
            if let Some(host) = trimmed.strip_prefix("Host ") {
                in_target_block = host.trim() == name;
            }
            if !in_target_block {
                kept.push(line);
            }
        }

        let mut updated = kept.join("\n");
        while updated.ends_with('\n') {
            updated.pop();
        }
        if !updated.is_empty() {
            updated.push('\n');
        }
        updated.push_str(&format!(
            "Host {name}\n    HostName {ip}\n    User {user}\n    IdentityFile {}\n    StrictHostKeyChecking no\n",
            key_path.display()
        ));

        fs::create_dir_all(self.ssh_dir())?;
        fs::write(&config_path, updated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostcfg::InstallMode;
    use tempfile::TempDir;

    fn config(name: &str, ip: &str) -> HostConfig {
        HostConfig {
            hostname: name.to_string(),
            username: "tower".to_string(),
            public_key: "ssh-ed25519 AAAA".to_string(),
            password_hash: "$6$s$h".to_string(),
            keyboard_layout: "us".to_string(),
            keyboard_variant: String::new(),
            timezone: "UTC".to_string(),
            lang: "en_US".to_string(),
            online: false,
            wlan_ssid: String::new(),
            wlan_shared_key: String::new(),
            thin_client_ip: "10.10.0.1".to_string(),
            tower_network: "10.10.0.0/24".to_string(),
            static_host_ip: ip.to_string(),
            router_ip: "10.20.0.254".to_string(),
            installation_mode: InstallMode::Install,
        }
    }

    #[test]
    fn record_round_trip_and_existence() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());

        assert!(!registry.exists("alpha"));
        registry.save_record(&config("alpha", "10.10.0.2")).unwrap();
        assert!(registry.exists("alpha"));
        assert_eq!(
            registry.load_record("alpha").unwrap().static_host_ip,
            "10.10.0.2"
        );
    }

    #[test]
    fn taken_ips_collects_all_records() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());
        registry.save_record(&config("alpha", "10.10.0.2")).unwrap();
        registry.save_record(&config("beta", "10.10.0.3")).unwrap();

        let taken = registry.taken_ips();
        assert!(taken.contains(&"10.10.0.2".parse().unwrap()));
        assert!(taken.contains(&"10.10.0.3".parse().unwrap()));
        assert_eq!(taken.len(), 2);
    }

    #[test]
    fn hosts_listing_is_sorted() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());
        registry.save_record(&config("zeta", "10.10.0.3")).unwrap();
        registry.save_record(&config("alpha", "10.10.0.2")).unwrap();

        let names: Vec<String> = registry.hosts().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn update_ssh_config_appends_block() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());
        registry
            .update_ssh_config("alpha", "10.10.0.2", "tower", Path::new("/keys/alpha"))
            .unwrap();

        let written = fs::read_to_string(registry.ssh_dir().join("config")).unwrap();
        assert!(written.contains("Host alpha"));
        assert!(written.contains("HostName 10.10.0.2"));
        assert!(written.contains("IdentityFile /keys/alpha"));
    }

    #[test]
    fn update_ssh_config_replaces_existing_block_only() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());
        registry
            .update_ssh_config("alpha", "10.10.0.2", "tower", Path::new("/keys/alpha"))
            .unwrap();
        registry
            .update_ssh_config("beta", "10.10.0.3", "tower", Path::new("/keys/beta"))
            .unwrap();
        registry
            .update_ssh_config("alpha", "10.10.0.9", "tower", Path::new("/keys/alpha"))
            .unwrap();

        let written = fs::read_to_string(registry.ssh_dir().join("config")).unwrap();
        assert!(written.contains("HostName 10.10.0.9"));
        assert!(!written.contains("HostName 10.10.0.2"));
        assert!(written.contains("HostName 10.10.0.3"));
        assert_eq!(written.matches("Host alpha").count(), 1);
    }
}
