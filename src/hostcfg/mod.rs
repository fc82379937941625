//! Host configuration records.
//!
//! A [`HostConfig`] is everything the target host needs to initialize
//! itself on first boot: identity, credentials, locale, and network
//! assignment. It is serialized as flat `KEY='value'` lines, both for the
//! persisted per-host record and for the `tower.env` hand-off file on the
//! boot partition. The plaintext one-time password is never part of the
//! record; only its hash is embedded.

pub mod generate;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// `install` creates a host with fresh keys and configuration; `update`
/// re-provisions an existing host, reusing its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    Install,
    Update,
}

impl InstallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMode::Install => "install",
            InstallMode::Update => "update",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "install" => Ok(InstallMode::Install),
            "update" => Ok(InstallMode::Update),
            _ => Err(Error::missing("installation-type")),
        }
    }
}

/// Complete configuration for one host provisioning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub hostname: String,
    pub username: String,
    pub public_key: String,
    pub password_hash: String,
    pub keyboard_layout: String,
    pub keyboard_variant: String,
    pub timezone: String,
    pub lang: String,
    pub online: bool,
    pub wlan_ssid: String,
    pub wlan_shared_key: String,
    pub thin_client_ip: String,
    pub tower_network: String,
    pub static_host_ip: String,
    pub router_ip: String,
    pub installation_mode: InstallMode,
}

impl HostConfig {
    /// Record fields in their canonical order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("HOSTNAME", self.hostname.clone()),
            ("USERNAME", self.username.clone()),
            ("PUBLIC_KEY", self.public_key.clone()),
            ("PASSWORD_HASH", self.password_hash.clone()),
            ("KEYBOARD_LAYOUT", self.keyboard_layout.clone()),
            ("KEYBOARD_VARIANT", self.keyboard_variant.clone()),
            ("TIMEZONE", self.timezone.clone()),
            ("LANG", self.lang.clone()),
            ("ONLINE", String::from(if self.online { "true" } else { "false" })),
            ("WLAN_SSID", self.wlan_ssid.clone()),
            ("WLAN_SHARED_KEY", self.wlan_shared_key.clone()),
            ("THIN_CLIENT_IP", self.thin_client_ip.clone()),
            ("TOWER_NETWORK", self.tower_network.clone()),
            ("STATIC_HOST_IP", self.static_host_ip.clone()),
            ("ROUTER_IP", self.router_ip.clone()),
            ("INSTALLATION_TYPE", self.installation_mode.as_str().to_string()),
        ]
    }

    /// Render the flat `KEY='value'` form consumed by the host's
    /// first-boot initialization.
    pub fn to_env_string(&self) -> String {
        self.pairs()
            .iter()
            .map(|(key, value)| format!("{key}='{value}'"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse the flat record form. Unknown keys are ignored; a missing
    /// required key is a [`Error::MissingEnvironmentValue`] naming the
    /// lowercased field.
    pub fn parse_env_str(raw: &str) -> Result<Self> {
        let mut values = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or(value);
            values.insert(key.to_string(), value.to_string());
        }

        let mut take = |key: &'static str| -> Result<String> {
            values
                .remove(key)
                .ok_or_else(|| Error::missing(&key.to_ascii_lowercase().replace('_', "-")))
        };

        Ok(HostConfig {
            hostname: take("HOSTNAME")?,
            username: take("USERNAME")?,
            public_key: take("PUBLIC_KEY")?,
            password_hash: take("PASSWORD_HASH")?,
            keyboard_layout: take("KEYBOARD_LAYOUT")?,
            keyboard_variant: take("KEYBOARD_VARIANT").unwrap_or_default(),
            timezone: take("TIMEZONE")?,
            lang: take("LANG")?,
            online: take("ONLINE")? == "true",
            wlan_ssid: take("WLAN_SSID").unwrap_or_default(),
            wlan_shared_key: take("WLAN_SHARED_KEY").unwrap_or_default(),
            thin_client_ip: take("THIN_CLIENT_IP")?,
            tower_network: take("TOWER_NETWORK")?,
            static_host_ip: take("STATIC_HOST_IP")?,
            router_ip: take("ROUTER_IP")?,
            installation_mode: InstallMode::parse(&take("INSTALLATION_TYPE")?)?,
        })
    }

    /// Write the record to `path`, owner read/write only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_env_string())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::parse_env_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample() -> HostConfig {
        HostConfig {
            hostname: "alpha".to_string(),
            username: "tower".to_string(),
            public_key: "ssh-ed25519 AAAA alpha".to_string(),
            password_hash: "$6$salt$hash".to_string(),
            keyboard_layout: "us".to_string(),
            keyboard_variant: String::new(),
            timezone: "Europe/Paris".to_string(),
            lang: "en_US".to_string(),
            online: false,
            wlan_ssid: String::new(),
            wlan_shared_key: String::new(),
            thin_client_ip: "10.10.0.1".to_string(),
            tower_network: "10.10.0.0/24".to_string(),
            static_host_ip: "10.10.0.2".to_string(),
            router_ip: "10.20.0.254".to_string(),
            installation_mode: InstallMode::Install,
        }
    }

    #[test]
    fn env_round_trip_preserves_fields() {
        let config = sample();
        let rendered = config.to_env_string();
        assert!(rendered.contains("HOSTNAME='alpha'"));
        assert!(rendered.contains("STATIC_HOST_IP='10.10.0.2'"));
        assert!(rendered.contains("INSTALLATION_TYPE='install'"));
        assert!(!rendered.contains("PASSWORD='"));

        let parsed = HostConfig::parse_env_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn parse_rejects_missing_required_key() {
        let raw = "HOSTNAME='alpha'\nUSERNAME='tower'";
        let err = HostConfig::parse_env_str(raw).unwrap_err();
        assert!(matches!(err, Error::MissingEnvironmentValue { .. }));
    }

    #[test]
    fn save_restricts_permissions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hosts").join("alpha.env");
        sample().save(&path).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded, sample());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
