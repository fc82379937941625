use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tower_provision::artifact::{resolve_cache_dir, ArtifactFetcher, HttpDownloader};
use tower_provision::error::Error;
use tower_provision::hostcfg::generate::GenerateRequest;
use tower_provision::preflight;
use tower_provision::process::SystemRunner;
use tower_provision::provision::{Confirmer, Outcome, ProvisionRequest, Provisioner};
use tower_provision::settings::Settings;
use tower_provision::sshconf::Registry;

fn usage() -> &'static str {
    "Usage:\n  tower-provision provision <name> [options]\n  tower-provision status\n  tower-provision fetch <artifact-name>\n\nProvision options:\n  --target <path>            target block device or image file (required)\n  --image <path>             host image override\n  --public-key-path <path>   install an existing public key\n  --keyboard-layout <code>   default: same as the thin client\n  --keyboard-variant <code>  default: same as the thin client\n  --timezone <tz>            e.g. Europe/Paris; default: same as the thin client\n  --lang <lang>              e.g. en_US; default: same as the thin client\n  --online                   attach the host to the online tower network\n  --wlan-ssid <ssid>         router only\n  --wlan-password <pass>     router only\n  --update                   re-provision an existing host, reusing its identity\n  --no-confirm               skip the confirmation prompt\n  --zero-device              overwrite the whole target with zeros first\n  --settings <path>          TOML settings override"
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();

    match args_ref.as_slice() {
        ["provision", name, rest @ ..] => provision(name, rest),
        ["status", rest @ ..] => status(rest),
        ["fetch", artifact, rest @ ..] => fetch(artifact, rest),
        _ => bail!(usage()),
    }
}

/// Asks on the terminal; only an explicit `y`/`yes` proceeds.
struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, message: &str) -> bool {
        print!("{message} [y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn provision(name: &str, rest: &[&str]) -> Result<()> {
    check_host_name(name)?;

    let mut request = ProvisionRequest {
        generate: GenerateRequest::new(name),
        ..Default::default()
    };
    let mut settings_path: Option<PathBuf> = None;

    let mut iter = rest.iter();
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| -> Result<String> {
            iter.next()
                .map(|v| v.to_string())
                .with_context(|| format!("{name} requires a value"))
        };
        match *flag {
            "--target" => request.target = Some(PathBuf::from(value("--target")?)),
            "--image" => request.image = Some(PathBuf::from(value("--image")?)),
            "--public-key-path" => {
                request.generate.public_key_path = Some(PathBuf::from(value("--public-key-path")?))
            }
            "--keyboard-layout" => {
                request.generate.keyboard_layout = Some(value("--keyboard-layout")?)
            }
            "--keyboard-variant" => {
                request.generate.keyboard_variant = Some(value("--keyboard-variant")?)
            }
            "--timezone" => request.generate.timezone = Some(value("--timezone")?),
            "--lang" => request.generate.lang = Some(value("--lang")?),
            "--online" => request.generate.online = true,
            "--wlan-ssid" => request.generate.wlan_ssid = Some(value("--wlan-ssid")?),
            "--wlan-password" => request.generate.wlan_password = Some(value("--wlan-password")?),
            "--update" => request.update = true,
            "--no-confirm" => request.no_confirm = true,
            "--zero-device" => request.zero_device = true,
            "--settings" => settings_path = Some(PathBuf::from(value("--settings")?)),
            other => bail!("unknown option `{other}`\n\n{}", usage()),
        }
    }

    let settings = Settings::load(settings_path.as_deref())?;
    let registry = Registry::new(settings.config_dir.clone());
    if !request.update && registry.exists(name) {
        bail!("host name `{name}` already used; pass --update to re-provision it");
    }
    if request.update && !registry.exists(name) {
        bail!("unknown host `{name}`; provision it first without --update");
    }

    preflight::check_host_tools()?;

    let runner = SystemRunner::new();
    let provisioner = Provisioner::new(settings, &runner, &HttpDownloader, &StdinConfirmer);

    match provisioner.provision(&request) {
        Ok(Outcome::Provisioned { ip, .. }) => {
            println!("host `{name}` ready with IP {ip}");
            println!("access it with `ssh {name}`");
            println!(
                "WARNING: for security reasons, remove the external device containing \
                 the boot partition from the host once it is up."
            );
            Ok(())
        }
        Ok(Outcome::Declined) => {
            println!("provisioning cancelled; nothing was written");
            Ok(())
        }
        Err(Error::UnreachableHost { hostname, ip, .. }) => {
            bail!(
                "the image was written successfully, but `{hostname}` did not answer at {ip}; \
                 check the tower network cabling and power, then retry discovery with `ssh {hostname}`"
            )
        }
        Err(e) => Err(e.into()),
    }
}

fn status(rest: &[&str]) -> Result<()> {
    let settings_path = parse_settings_only(rest)?;
    let settings = Settings::load(settings_path.as_deref())?;
    let registry = Registry::new(settings.config_dir.clone());

    let hosts = registry.hosts();
    if hosts.is_empty() {
        println!("no hosts provisioned yet");
        return Ok(());
    }
    for host in hosts {
        let network = if host.online { "online" } else { "offline" };
        println!("{:<16} {:<16} {network}", host.name, host.ip);
    }
    Ok(())
}

fn fetch(artifact: &str, rest: &[&str]) -> Result<()> {
    let settings_path = parse_settings_only(rest)?;
    let settings = Settings::load(settings_path.as_deref())?;

    let known: Vec<&str> = tower_provision::artifact::REQUIRED_ARTIFACTS
        .iter()
        .map(|a| a.name)
        .collect();
    if !known.contains(&artifact) {
        bail!("unknown artifact `{artifact}`; expected one of: {}", known.join(", "));
    }

    let cache_dir = resolve_cache_dir(settings.cache_dir.as_deref())?;
    let fetcher = ArtifactFetcher::new(cache_dir, &HttpDownloader);
    let fetched = fetcher.acquire(artifact)?;
    println!("{} verified at {}", fetched.name, fetched.path.display());
    Ok(())
}

fn parse_settings_only(rest: &[&str]) -> Result<Option<PathBuf>> {
    match rest {
        [] => Ok(None),
        ["--settings", path] => Ok(Some(PathBuf::from(path))),
        _ => bail!(usage()),
    }
}

/// Host names drive filesystem paths and SSH config entries: 1-15
/// alphanumeric/hyphen characters, not purely numeric.
fn check_host_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if name.is_empty() || name.len() > 15 || !valid_chars {
        bail!("host name invalid: must be 1-15 alphanumeric or hyphen characters");
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        bail!("host name invalid: must not be purely numeric");
    }
    Ok(())
}
