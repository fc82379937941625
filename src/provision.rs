//! The provisioning orchestrator.
//!
//! Sequences one transactional session:
//! validate config → select target → acquire artifact → confirm the
//! destructive write → write image → inject config → persist record (new
//! hosts) → discover the host. The confirmation is a hard gate; every
//! state from the image write onward runs under the device session's
//! cleanup guarantee, and a discovery timeout is reported without rolling
//! back the written image.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::artifact::{self, ArtifactFetcher, Downloader};
use crate::device::{self, DeviceSession, BOOTFS_DIR, ROOTFS_DIR};
use crate::discovery::{self, DiscoverySpec};
use crate::error::{Error, Result};
use crate::hostcfg::generate::{self, GenerateRequest, GeneratedConfig};
use crate::hostcfg::HostConfig;
use crate::layout::{self, PartitionLayout};
use crate::process::{Cmd, Runner};
use crate::settings::Settings;
use crate::sshconf::Registry;
use crate::task;

/// Yes/no decision for the destructive-write gate. The prompt UI lives
/// with the caller.
pub trait Confirmer {
    fn confirm(&self, message: &str) -> bool;
}

/// Non-interactive override: every confirmation is a yes.
pub struct AlwaysConfirm;

impl Confirmer for AlwaysConfirm {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Inputs for one provisioning session.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub generate: GenerateRequest,
    /// Re-provision an existing host, reusing its record and keypair.
    pub update: bool,
    /// Target block device or image file path.
    pub target: Option<PathBuf>,
    /// Host image override; otherwise the cache is scanned and the
    /// pinned artifact downloaded as a last resort.
    pub image: Option<PathBuf>,
    /// Skip the confirmation prompt.
    pub no_confirm: bool,
    /// Overwrite the whole target with zeros first.
    pub zero_device: bool,
}

/// Result of a provisioning session.
#[derive(Debug)]
pub enum Outcome {
    /// The host is provisioned; the config has the password redacted.
    Provisioned { config: HostConfig, ip: String },
    /// The operator declined the destructive write; nothing was touched.
    Declined,
}

/// Orchestrates provisioning sessions against injected capabilities.
pub struct Provisioner<'a> {
    settings: Settings,
    runner: &'a dyn Runner,
    downloader: &'a dyn Downloader,
    confirmer: &'a dyn Confirmer,
    registry: Registry,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        settings: Settings,
        runner: &'a dyn Runner,
        downloader: &'a dyn Downloader,
        confirmer: &'a dyn Confirmer,
    ) -> Self {
        let registry = Registry::new(settings.config_dir.clone());
        Self {
            settings,
            runner,
            downloader,
            confirmer,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one full provisioning session.
    pub fn provision(&self, request: &ProvisionRequest) -> Result<Outcome> {
        let name = request.generate.name.clone();
        task::scoped(&format!("provisioning {name}..."), || {
            self.provision_inner(request, &name)
        })
    }

    fn provision_inner(&self, request: &ProvisionRequest, name: &str) -> Result<Outcome> {
        // ValidateConfig: nothing destructive is reachable before this
        // passes.
        let generated = if request.update {
            generate::prepare_update(&self.registry, name)?
        } else {
            generate::generate(&request.generate, &self.settings, &self.registry, self.runner)?
        };
        if !request.update {
            log::info!(
                "one-time password for `{name}`: {}",
                generated.password.as_str()
            );
        }

        // SelectTarget
        let target = self.select_target(request)?;

        // AcquireArtifact
        let image = self.acquire_image(request)?;

        // ConfirmDestructive: hard gate before anything is written.
        let message = format!(
            "Are you sure you want to completely wipe `{}` and install TowerOS-Host \
             on it for the host `{name}`?",
            target.display()
        );
        if !request.no_confirm && !self.confirmer.confirm(&message) {
            log::info!("provisioning of `{name}` cancelled");
            return Ok(Outcome::Declined);
        }

        let config = &generated.config;

        // WriteImage + InjectConfig under the cleanup guarantee: the
        // session's Drop releases mounts, loop devices and the working
        // directory on every early return below.
        let mut session = DeviceSession::begin(self.runner, &self.settings)?;
        let boot_partition = task::scoped(
            &format!("installing TowerOS-Host in {}...", target.display()),
            || self.write_image(&mut session, &image, &target, request.zero_device),
        )?;
        task::scoped("configuring image...", || {
            self.inject_config(&mut session, &boot_partition, config)
        })?;
        session.release()?;

        // PersistRecord: brand-new hosts only, and only after the
        // confirmed write.
        if !request.update {
            self.registry.save_record(config)?;
            self.registry.update_ssh_config(
                name,
                &config.static_host_ip,
                &config.username,
                &generated.private_key_path,
            )?;
        }

        // DiscoverHost: an update reuses a host that is already known to
        // be reachable.
        if !request.update {
            self.discover_host(&generated)?;
        }

        log::info!("host ready with IP: {}", config.static_host_ip);
        log::info!("access the host `{name}` with `ssh {name}`");

        Ok(Outcome::Provisioned {
            config: config.clone(),
            ip: config.static_host_ip.clone(),
        })
    }

    fn select_target(&self, request: &ProvisionRequest) -> Result<PathBuf> {
        let target = request
            .target
            .clone()
            .ok_or_else(|| Error::missing("boot-device"))?;
        if is_block_device(&target) {
            let devices = device::list_block_devices(self.runner)?;
            let target_str = target.display().to_string();
            if !devices.contains(&target_str) {
                return Err(Error::Command(anyhow::anyhow!(
                    "target `{target_str}` is not an attached disk"
                )));
            }
            if devices.len() == 1 {
                return Err(Error::Command(anyhow::anyhow!(
                    "refusing to write to `{target_str}`: it is the only disk on this machine"
                )));
            }
        }
        Ok(target)
    }

    fn acquire_image(&self, request: &ProvisionRequest) -> Result<PathBuf> {
        let path = match &request.image {
            Some(image) if image.is_file() => image.clone(),
            _ => match artifact::find_host_image(self.settings.cache_dir.as_deref()) {
                Some(image) => image,
                None => {
                    let cache_dir = artifact::resolve_cache_dir(self.settings.cache_dir.as_deref())?;
                    let fetcher = ArtifactFetcher::new(cache_dir, self.downloader);
                    fetcher.acquire("toweros-host")?.path
                }
            },
        };
        artifact::prepare_host_image(&path, self.runner)
    }

    fn plan_layout(&self, root_content_size: u64) -> PartitionLayout {
        layout::plan(
            root_content_size,
            self.settings.boot_size,
            self.settings.alignment,
            self.settings.margin_fraction,
            self.settings.margin_floor,
        )
    }

    /// Write the image onto the target and return the boot partition
    /// device path.
    ///
    /// Raw disk images are copied with `dd` and the root partition grown
    /// into the planned margin; rootfs archives go through
    /// partition → format → mount → extract with the planner driving the
    /// MBR entries directly.
    fn write_image(
        &self,
        session: &mut DeviceSession,
        image: &Path,
        target: &Path,
        zero_device: bool,
    ) -> Result<String> {
        let image_size = std::fs::metadata(image)?.len();
        let plan = self.plan_layout(image_size);

        if is_rootfs_archive(image) {
            return self.write_rootfs_archive(session, image, target, zero_device, &plan);
        }

        if is_block_device(target) {
            let target_str = target.display().to_string();
            device::unmount_device_partitions(self.runner, &target_str)?;
            if zero_device {
                session.zero_device(target)?;
            }
            session.write_raw(image, target)?;
            let (boot, root) = device::partition_paths(&target_str);
            session.grow_root(target, &root)?;
            Ok(boot)
        } else {
            // File target: size the image per the planner so the grow
            // step has the margin to expand into.
            sparse_file(target, plan.image_size.max(image_size))?;
            session.splice_raw(image, target)?;
            let loop_dev = session.attach_loop(target)?;
            let (boot, root) = device::partition_paths(&loop_dev);
            session.grow_root(Path::new(&loop_dev), &root)?;
            Ok(boot)
        }
    }

    fn write_rootfs_archive(
        &self,
        session: &mut DeviceSession,
        archive: &Path,
        target: &Path,
        zero_device: bool,
        plan: &PartitionLayout,
    ) -> Result<String> {
        let base_device = if is_block_device(target) {
            let target_str = target.display().to_string();
            device::unmount_device_partitions(self.runner, &target_str)?;
            if zero_device {
                session.zero_device(target)?;
            }
            session.partition(target, plan)?;
            target_str
        } else {
            sparse_file(target, plan.image_size)?;
            session.partition(target, plan)?;
            session.attach_loop(target)?
        };

        let (boot, root) = device::partition_paths(&base_device);
        session.format_boot(&boot)?;
        session.format_root(&root)?;

        let root_mount = session.mount(&root, ROOTFS_DIR, "ext4")?;
        std::fs::create_dir_all(root_mount.join("boot"))?;
        session.mount(&boot, &format!("{ROOTFS_DIR}/boot"), "vfat")?;
        session.extract_archive(archive, &root_mount)?;
        session.sync()?;
        session.unmount_all();

        Ok(boot)
    }

    /// Mount the boot partition and write the `tower.env` hand-off file
    /// consumed by the host's first-boot initialization.
    fn inject_config(
        &self,
        session: &mut DeviceSession,
        boot_partition: &str,
        config: &HostConfig,
    ) -> Result<()> {
        let mountpoint = session.mount(boot_partition, BOOTFS_DIR, "vfat")?;
        let env = config.to_env_string();
        log::debug!("host configuration:\n{env}");
        self.runner.run(
            &Cmd::new("tee")
                .arg_path(&mountpoint.join("tower.env"))
                .stdin(&env)
                .privileged()
                .error_msg("writing tower.env failed"),
        )?;
        Ok(())
    }

    fn discover_host(&self, generated: &GeneratedConfig) -> Result<()> {
        let config = &generated.config;
        let spec = DiscoverySpec {
            hostname: config.hostname.clone(),
            target_ip: config.static_host_ip.clone(),
            user: config.username.clone(),
            key_path: generated.private_key_path.clone(),
            poll_interval: self.settings.discovery_poll_interval,
            max_wait: self.settings.discovery_max_wait,
        };
        discovery::discover(self.runner, &self.registry, &spec)
    }
}

fn is_block_device(path: &Path) -> bool {
    path.starts_with("/dev")
}

fn is_rootfs_archive(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".tar.gz"))
        .unwrap_or(false)
}

/// Create (or extend) a sparse file of exactly `size` bytes.
fn sparse_file(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    file.set_len(size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostcfg::InstallMode;
    use crate::process::fake::FakeRunner;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoDownloads;

    impl Downloader for NoDownloads {
        fn fetch(&self, url: &str, _dest: &Path) -> Result<()> {
            panic!("unexpected download of {url}");
        }
    }

    struct NeverConfirm;

    impl Confirmer for NeverConfirm {
        fn confirm(&self, _message: &str) -> bool {
            false
        }
    }

    fn test_settings(tmp: &TempDir) -> Settings {
        Settings {
            config_dir: tmp.path().join("tower"),
            work_dir: tmp.path().join("work"),
            cache_dir: Some(tmp.path().join("cache")),
            loop_retry_delay: Duration::ZERO,
            discovery_poll_interval: Duration::from_millis(10),
            discovery_max_wait: Duration::from_millis(30),
            ..Settings::default()
        }
    }

    fn seed_image(tmp: &TempDir) -> PathBuf {
        let cache = tmp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let image = cache.join("toweros-host-0.1.0.img");
        fs::write(&image, vec![0u8; 4096]).unwrap();
        image
    }

    fn request(tmp: &TempDir) -> ProvisionRequest {
        let pub_key = tmp.path().join("alpha.pub");
        fs::write(&pub_key, "ssh-ed25519 AAAA alpha\n").unwrap();
        ProvisionRequest {
            generate: GenerateRequest {
                public_key_path: Some(pub_key),
                keyboard_layout: Some("us".to_string()),
                keyboard_variant: Some(String::new()),
                timezone: Some("Europe/Paris".to_string()),
                lang: Some("en_US".to_string()),
                ..GenerateRequest::new("alpha")
            },
            target: Some(tmp.path().join("target.img")),
            ..Default::default()
        }
    }

    fn fake_runner() -> FakeRunner {
        let fake = FakeRunner::new();
        fake.queue_stdout("losetup", &["/dev/loop5"]);
        fake
    }

    #[test]
    fn end_to_end_offline_install_assigns_first_free_ip() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &AlwaysConfirm);

        let outcome = provisioner.provision(&request(&tmp)).unwrap();
        let Outcome::Provisioned { config, ip } = outcome else {
            panic!("expected a provisioned outcome");
        };
        assert_eq!(ip, "10.10.0.2");
        assert_eq!(config.static_host_ip, "10.10.0.2");
        assert_eq!(config.installation_mode, InstallMode::Install);

        // record persisted, ssh config registered, working dir removed
        assert!(provisioner.registry().exists("alpha"));
        let ssh_config =
            fs::read_to_string(provisioner.registry().ssh_dir().join("config")).unwrap();
        assert!(ssh_config.contains("Host alpha"));
        assert!(ssh_config.contains("HostName 10.10.0.2"));
        assert!(!settings.work_dir.exists());

        // target image sized per the planner
        let plan = layout::plan(
            4096,
            settings.boot_size,
            settings.alignment,
            settings.margin_fraction,
            settings.margin_floor,
        );
        let target_len = fs::metadata(tmp.path().join("target.img")).unwrap().len();
        assert_eq!(target_len, plan.image_size);

        // the raw write ran, the root partition was grown, the config
        // was injected on the boot partition
        assert_eq!(fake.calls_of("dd").len(), 1);
        assert!(fake
            .calls_of("parted")
            .iter()
            .any(|c| c.contains("resizepart 2 100%")));
        assert_eq!(fake.calls_of("resize2fs"), vec!["resize2fs /dev/loop5p2"]);
        assert!(fake.calls_of("tee")[0].contains("BOOTFS_DIR/tower.env"));
        // cleanup detached the loop device
        assert!(fake
            .calls_of("losetup")
            .last()
            .unwrap()
            .contains("-d /dev/loop5"));
    }

    #[test]
    fn declining_the_confirmation_has_no_side_effects() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &NeverConfirm);

        let outcome = provisioner.provision(&request(&tmp)).unwrap();
        assert!(matches!(outcome, Outcome::Declined));

        assert!(!provisioner.registry().exists("alpha"));
        assert!(!tmp.path().join("target.img").exists());
        assert!(fake.calls_of("dd").is_empty());
        assert!(fake.calls_of("parted").is_empty());
    }

    #[test]
    fn write_failure_cleans_up_and_persists_nothing() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        fake.fail_program("dd");
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &AlwaysConfirm);

        let err = provisioner.provision(&request(&tmp)).unwrap_err();
        assert!(matches!(err, Error::Command(_)));

        assert!(!settings.work_dir.exists());
        assert!(!provisioner.registry().exists("alpha"));
        assert!(fake.calls_of("mount").is_empty());
    }

    #[test]
    fn inject_failure_unmounts_and_detaches_everything() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        fake.fail_program("tee");
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &AlwaysConfirm);

        let err = provisioner.provision(&request(&tmp)).unwrap_err();
        assert!(matches!(err, Error::Command(_)));

        assert!(!settings.work_dir.exists());
        // the one mount was lazily unmounted and the loop detached
        assert_eq!(fake.calls_of("mount").len(), 1);
        assert_eq!(fake.calls_of("umount").len(), 1);
        assert!(fake
            .calls_of("losetup")
            .last()
            .unwrap()
            .contains("-d /dev/loop5"));
        assert!(!provisioner.registry().exists("alpha"));
    }

    #[test]
    fn unreachable_host_is_reported_but_image_work_stands() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        fake.fail_program("ssh");
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &AlwaysConfirm);

        let err = provisioner.provision(&request(&tmp)).unwrap_err();
        assert!(matches!(err, Error::UnreachableHost { .. }));

        // the write succeeded and the record stays; only discovery failed
        assert!(provisioner.registry().exists("alpha"));
        assert!(!settings.work_dir.exists());
        assert!(tmp.path().join("target.img").exists());
    }

    #[test]
    fn update_skips_generation_persistence_and_discovery() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &AlwaysConfirm);

        // first install
        provisioner.provision(&request(&tmp)).unwrap();
        let record_before = fs::read_to_string(provisioner.registry().record_path("alpha")).unwrap();
        let probes_before = fake.calls_of("ssh").len();

        // update session: reattach loop for the second write
        fake.queue_stdout("losetup", &["/dev/loop6"]);
        let mut update_request = request(&tmp);
        update_request.update = true;
        let outcome = provisioner.provision(&update_request).unwrap();
        let Outcome::Provisioned { config, .. } = outcome else {
            panic!("expected a provisioned outcome");
        };
        assert_eq!(config.installation_mode, InstallMode::Update);

        // no new discovery probe, record untouched
        assert_eq!(fake.calls_of("ssh").len(), probes_before);
        let record_after = fs::read_to_string(provisioner.registry().record_path("alpha")).unwrap();
        assert_eq!(record_before, record_after);
    }

    #[test]
    fn concurrent_sessions_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        fs::create_dir_all(&settings.work_dir).unwrap();
        let fake = fake_runner();
        let provisioner = Provisioner::new(settings, &fake, &NoDownloads, &AlwaysConfirm);

        let err = provisioner.provision(&request(&tmp)).unwrap_err();
        assert!(matches!(err, Error::ConcurrentBuild { .. }));
    }

    #[test]
    fn missing_target_fails_before_any_device_work() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        seed_image(&tmp);
        let fake = fake_runner();
        let provisioner = Provisioner::new(settings, &fake, &NoDownloads, &AlwaysConfirm);

        let mut req = request(&tmp);
        req.target = None;
        let err = provisioner.provision(&req).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingEnvironmentValue { field } if field == "boot-device"
        ));
        assert!(fake.calls_of("dd").is_empty());
    }

    #[test]
    fn rootfs_archive_goes_through_partition_format_extract() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp);
        let cache = tmp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let archive = cache.join("toweros-host-rootfs-0.1.0.tar.gz");
        fs::write(&archive, vec![0u8; 2048]).unwrap();

        let fake = fake_runner();
        let provisioner = Provisioner::new(settings.clone(), &fake, &NoDownloads, &AlwaysConfirm);

        let mut req = request(&tmp);
        req.image = Some(archive);
        let outcome = provisioner.provision(&req).unwrap();
        assert!(matches!(outcome, Outcome::Provisioned { .. }));

        let parted = fake.calls_of("parted");
        assert!(parted.iter().any(|c| c.contains("mklabel msdos")));
        assert!(parted.iter().any(|c| c.contains("mkpart primary fat32")));
        assert!(parted.iter().any(|c| c.contains("mkpart primary ext4")));
        assert_eq!(fake.calls_of("mkdosfs").len(), 1);
        assert_eq!(fake.calls_of("mkfs.ext4").len(), 1);
        assert_eq!(fake.calls_of("tar").len(), 1);
        // two mounts for the extract, one for the injection
        assert_eq!(fake.calls_of("mount").len(), 3);
        assert_eq!(fake.calls_of("umount").len(), 3);
        assert!(!settings.work_dir.exists());
    }
}
