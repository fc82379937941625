//! Host configuration synthesis.
//!
//! Validates every required input before producing a value that could
//! drive a destructive action: keys are read or freshly generated,
//! the one-time password is hashed for the target's shadow file, locale
//! falls back to the provisioning machine's own settings, and the network
//! identity is assigned from the registry's view of the tower networks.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha_crypt::{sha512_simple, Sha512Params};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{check_environment_value, Error, Result};
use crate::hostcfg::{HostConfig, InstallMode};
use crate::network::{derive_wlan_key, next_free_ip};
use crate::process::{Cmd, Runner};
use crate::settings::Settings;
use crate::sshconf::Registry;

/// Inputs for generating a new host configuration.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub name: String,
    /// Existing public key to install on the host. When unset a fresh
    /// ed25519 pair is generated, unless generation is disabled.
    pub public_key_path: Option<PathBuf>,
    pub generate_keypair: bool,
    pub keyboard_layout: Option<String>,
    pub keyboard_variant: Option<String>,
    pub timezone: Option<String>,
    pub lang: Option<String>,
    pub online: bool,
    pub wlan_ssid: Option<String>,
    pub wlan_password: Option<String>,
}

impl GenerateRequest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generate_keypair: true,
            ..Default::default()
        }
    }
}

/// A generated configuration plus the secrets that never enter the
/// persisted record.
#[derive(Debug)]
pub struct GeneratedConfig {
    pub config: HostConfig,
    /// One-time password, surfaced to the operator exactly once.
    pub password: Zeroizing<String>,
    pub private_key_path: PathBuf,
}

/// Generate the configuration for a brand-new host.
pub fn generate(
    request: &GenerateRequest,
    settings: &Settings,
    registry: &Registry,
    runner: &dyn Runner,
) -> Result<GeneratedConfig> {
    log::info!("preparing host configuration...");
    let name = check_environment_value("name", Some(request.name.as_str()))?;

    let (public_key_path, private_key_path) = match &request.public_key_path {
        Some(path) => (path.clone(), private_key_for(path)),
        None if request.generate_keypair => generate_key_pair(&name, &registry.ssh_dir(), runner)?,
        None => return Err(Error::missing("public-key-path")),
    };
    let public_key = fs::read_to_string(&public_key_path)
        .map_err(|_| Error::missing("public-key-path"))?
        .trim()
        .to_string();
    if public_key.is_empty() {
        return Err(Error::missing("public-key-path"));
    }

    generate_luks_key(&name, &settings.config_dir)?;

    let password = generate_password();
    let params = Sha512Params::new(5_000)
        .map_err(|e| Error::Command(anyhow::anyhow!("invalid sha512-crypt rounds: {e:?}")))?;
    let password_hash = sha512_simple(&password, &params)
        .map_err(|e| Error::Command(anyhow::anyhow!("password hashing failed: {e:?}")))?;

    let (keyboard_layout, keyboard_variant) = match (&request.keyboard_layout, &request.keyboard_variant) {
        (Some(layout), variant) => (layout.clone(), variant.clone().unwrap_or_default()),
        (None, variant) => {
            let (detected_layout, detected_variant) = detect_keymap(runner)?;
            (
                detected_layout,
                variant.clone().unwrap_or(detected_variant),
            )
        }
    };
    let timezone = match &request.timezone {
        Some(tz) => tz.clone(),
        None => detect_timezone(runner)?,
    };
    let lang = match &request.lang {
        Some(lang) => lang.clone(),
        None => detect_lang()?,
    };

    let is_router = name == settings.router_hostname;
    let online = request.online || is_router;

    let (wlan_ssid, wlan_shared_key) = if is_router {
        let ssid = check_environment_value("wlan-ssid", request.wlan_ssid.as_deref())?;
        let passphrase = check_environment_value("wlan-password", request.wlan_password.as_deref())?;
        let psk = derive_wlan_key(&ssid, &passphrase);
        (ssid, psk)
    } else {
        (String::new(), String::new())
    };

    let (network, thin_client_ip) = if online {
        (settings.network_online, settings.thin_client_ip_online)
    } else {
        (settings.network_offline, settings.thin_client_ip_offline)
    };

    let host_ip = if is_router {
        settings.router_ip
    } else {
        let mut taken: BTreeSet<_> = registry.taken_ips();
        taken.insert(thin_client_ip);
        taken.insert(settings.router_ip);
        next_free_ip(&network, settings.first_host_offset, &taken).ok_or_else(|| {
            Error::Command(anyhow::anyhow!("tower network {network} has no free address"))
        })?
    };

    let config = HostConfig {
        hostname: name,
        username: settings.default_user.clone(),
        public_key,
        password_hash,
        keyboard_layout,
        keyboard_variant,
        timezone,
        lang,
        online,
        wlan_ssid,
        wlan_shared_key,
        thin_client_ip: thin_client_ip.to_string(),
        tower_network: network.to_string(),
        static_host_ip: host_ip.to_string(),
        router_ip: settings.router_ip.to_string(),
        installation_mode: InstallMode::Install,
    };

    Ok(GeneratedConfig {
        config,
        password,
        private_key_path,
    })
}

/// Reload the persisted record for an `update` installation, reusing the
/// existing keypair and registry entry.
pub fn prepare_update(registry: &Registry, name: &str) -> Result<GeneratedConfig> {
    let mut config = registry
        .load_record(name)
        .map_err(|_| Error::missing("name"))?;
    config.installation_mode = InstallMode::Update;
    Ok(GeneratedConfig {
        config,
        password: Zeroizing::new(String::new()),
        private_key_path: registry.private_key_path(name),
    })
}

fn private_key_for(public_key_path: &Path) -> PathBuf {
    match public_key_path.extension().and_then(|e| e.to_str()) {
        Some("pub") => public_key_path.with_extension(""),
        _ => public_key_path.to_path_buf(),
    }
}

/// Generate a fresh ed25519 keypair under the tower SSH directory,
/// removing any stale pair of the same name first.
fn generate_key_pair(
    name: &str,
    ssh_dir: &Path,
    runner: &dyn Runner,
) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(ssh_dir)?;
    let key_path = ssh_dir.join(name);
    let pub_path = ssh_dir.join(format!("{name}.pub"));
    if key_path.exists() {
        fs::remove_file(&key_path)?;
    }
    if pub_path.exists() {
        fs::remove_file(&pub_path)?;
    }
    runner.run(
        &Cmd::new("ssh-keygen")
            .args(["-t", "ed25519", "-C", name])
            .arg("-f")
            .arg_path(&key_path)
            .args(["-N", ""])
            .error_msg("ssh-keygen failed"),
    )?;
    Ok((pub_path, key_path))
}

/// Random key material for the host's encrypted root, kept only on the
/// thin client.
fn generate_luks_key(name: &str, config_dir: &Path) -> Result<()> {
    let path = config_dir
        .join("luks")
        .join(format!("{name}_crypto_keyfile.bin"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut key = vec![0u8; 2048];
    OsRng.fill_bytes(&mut key);
    fs::write(&path, &key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// 22 alphanumeric characters from the OS CSPRNG (~131 bits).
fn generate_password() -> Zeroizing<String> {
    let password: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect();
    Zeroizing::new(password)
}

fn detect_keymap(runner: &dyn Runner) -> Result<(String, String)> {
    let out = runner.run(
        &Cmd::new("localectl")
            .arg("status")
            .error_msg("localectl failed"),
    )?;
    let layout = parse_status_field(&out.stdout, "X11 Layout:")
        .ok_or_else(|| Error::missing("keyboard-layout"))?;
    let variant = parse_status_field(&out.stdout, "X11 Variant:").unwrap_or_default();
    Ok((layout, variant))
}

fn detect_timezone(runner: &dyn Runner) -> Result<String> {
    let out = runner.run(
        &Cmd::new("timedatectl")
            .args(["show", "-p", "Timezone", "--value"])
            .error_msg("timedatectl failed"),
    )?;
    let timezone = out.stdout_trimmed().to_string();
    if timezone.is_empty() {
        return Err(Error::missing("timezone"));
    }
    Ok(timezone)
}

fn detect_lang() -> Result<String> {
    let lang = std::env::var("LANG").unwrap_or_default();
    let lang = lang.split('.').next().unwrap_or_default().to_string();
    if lang.is_empty() {
        return Err(Error::missing("lang"));
    }
    Ok(lang)
}

fn parse_status_field(output: &str, label: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(label))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
