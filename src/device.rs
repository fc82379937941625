//! Device lifecycle management: loop devices, partitioning, formatting,
//! mounts, and the guaranteed-cleanup session.
//!
//! A [`DeviceSession`] owns every mount point and loop device it creates
//! and releases all of them on every exit path. Explicit [`release`]
//! reports problems; the `Drop` backstop covers early returns and
//! operator interrupts so no stale mount, loop device, or working
//! directory survives a failed session.
//!
//! [`release`]: DeviceSession::release

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::PartitionLayout;
use crate::process::{Cmd, Runner};
use crate::settings::Settings;

/// Mount point (relative to the working directory) for the boot
/// partition during config injection.
pub const BOOTFS_DIR: &str = "BOOTFS_DIR";
/// Mount point for the root partition while extracting a rootfs archive.
pub const ROOTFS_DIR: &str = "ROOTFS_DIR";

/// Partition device paths for a two-partition target.
///
/// Devices whose name ends in a digit (loop, nvme, mmcblk) take a `p`
/// separator; plain disks append the number directly.
pub fn partition_paths(device: &str) -> (String, String) {
    let needs_p = device
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    if needs_p {
        (format!("{device}p1"), format!("{device}p2"))
    } else {
        (format!("{device}1"), format!("{device}2"))
    }
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Whole-disk device paths visible on this machine (`lsblk -J -d`).
pub fn list_block_devices(runner: &dyn Runner) -> Result<Vec<String>> {
    let out = runner.run(
        &Cmd::new("lsblk")
            .args(["-J", "-d"])
            .error_msg("lsblk failed"),
    )?;
    let report: LsblkReport = serde_json::from_str(&out.stdout)
        .map_err(|e| Error::Command(anyhow::anyhow!("unparseable lsblk output: {e}")))?;
    Ok(report
        .blockdevices
        .into_iter()
        .map(|d| format!("/dev/{}", d.name))
        .collect())
}

/// Lazily unmount every mounted partition of `device` before it is
/// overwritten.
pub fn unmount_device_partitions(runner: &dyn Runner, device: &str) -> Result<()> {
    let out = runner.run(&Cmd::new("lsblk").args(["-J", device]).allow_fail())?;
    if !out.success {
        return Ok(());
    }
    let report: LsblkReport = match serde_json::from_str(&out.stdout) {
        Ok(report) => report,
        Err(_) => return Ok(()),
    };

    let mut mountpoints = Vec::new();
    for dev in &report.blockdevices {
        collect_mountpoints(dev, &mut mountpoints);
    }
    for mp in mountpoints {
        lazy_umount(runner, Path::new(&mp));
    }
    Ok(())
}

fn collect_mountpoints(dev: &LsblkDevice, out: &mut Vec<String>) {
    out.extend(dev.mountpoints.iter().flatten().cloned());
    for child in &dev.children {
        collect_mountpoints(child, out);
    }
}

/// Lazy unmount so cleanup never hangs on a busy filesystem. Best-effort:
/// a mount point that is already gone is not an error.
fn lazy_umount(runner: &dyn Runner, mountpoint: &Path) {
    let _ = runner.run(
        &Cmd::new("umount")
            .arg("-l")
            .arg_path(mountpoint)
            .privileged()
            .allow_fail(),
    );
}

/// One device-touching provisioning session.
pub struct DeviceSession<'a> {
    runner: &'a dyn Runner,
    work_dir: PathBuf,
    loop_attach_attempts: u32,
    loop_retry_delay: Duration,
    mounts: Vec<PathBuf>,
    loops: Vec<String>,
    released: bool,
}

impl std::fmt::Debug for DeviceSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("work_dir", &self.work_dir)
            .field("loop_attach_attempts", &self.loop_attach_attempts)
            .field("loop_retry_delay", &self.loop_retry_delay)
            .field("mounts", &self.mounts)
            .field("loops", &self.loops)
            .field("released", &self.released)
            .finish()
    }
}

impl<'a> DeviceSession<'a> {
    /// Start a session, creating the working directory.
    ///
    /// A pre-existing working directory means another session may be in
    /// progress: refuse with [`Error::ConcurrentBuild`] instead of
    /// interleaving state. This is the pipeline's only concurrency guard.
    pub fn begin(runner: &'a dyn Runner, settings: &Settings) -> Result<Self> {
        if settings.work_dir.exists() {
            return Err(Error::ConcurrentBuild {
                working_dir: settings.work_dir.clone(),
            });
        }
        fs::create_dir_all(&settings.work_dir)?;
        Ok(Self {
            runner,
            work_dir: settings.work_dir.clone(),
            loop_attach_attempts: settings.loop_attach_attempts.max(1),
            loop_retry_delay: settings.loop_retry_delay,
            mounts: Vec::new(),
            loops: Vec::new(),
            released: false,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn wd(&self, rel: &str) -> PathBuf {
        self.work_dir.join(rel)
    }

    /// Bind a loop device to an image file, partition scanning enabled.
    ///
    /// `losetup` occasionally returns nothing under transient contention;
    /// retry with a fixed delay up to the configured attempt budget, then
    /// fail with [`Error::DeviceAcquisitionFailure`].
    pub fn attach_loop(&mut self, image: &Path) -> Result<String> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let out = self.runner.run(
                &Cmd::new("losetup")
                    .args(["--show", "--find", "--partscan"])
                    .arg_path(image)
                    .privileged()
                    .error_msg("losetup failed"),
            )?;
            let device = out.stdout_trimmed().to_string();
            if !device.is_empty() {
                self.loops.push(device.clone());
                return Ok(device);
            }
            if attempts >= self.loop_attach_attempts {
                return Err(Error::DeviceAcquisitionFailure { attempts });
            }
            thread::sleep(self.loop_retry_delay);
        }
    }

    /// Write an MBR label and the two partitions from `layout`.
    pub fn partition(&self, target: &Path, layout: &PartitionLayout) -> Result<()> {
        self.runner.run(
            &Cmd::new("parted")
                .arg("--script")
                .arg_path(target)
                .args(["mklabel", "msdos"])
                .privileged()
                .error_msg("parted mklabel failed"),
        )?;
        self.runner.run(
            &Cmd::new("parted")
                .arg("--script")
                .arg_path(target)
                .args(["unit", "B", "mkpart", "primary", "fat32"])
                .arg(layout.boot_start.to_string())
                .arg(layout.boot_end.to_string())
                .privileged()
                .error_msg("parted mkpart (boot) failed"),
        )?;
        self.runner.run(
            &Cmd::new("parted")
                .arg("--script")
                .arg_path(target)
                .args(["unit", "B", "mkpart", "primary", "ext4"])
                .arg(layout.root_start.to_string())
                .arg(layout.root_end.to_string())
                .privileged()
                .error_msg("parted mkpart (root) failed"),
        )?;
        Ok(())
    }

    pub fn format_boot(&self, partition: &str) -> Result<()> {
        self.runner.run(
            &Cmd::new("mkdosfs")
                .args(["-n", "bootfs", "-F", "32", "-s", "4"])
                .arg(partition)
                .privileged()
                .error_msg("mkdosfs failed"),
        )?;
        Ok(())
    }

    pub fn format_root(&self, partition: &str) -> Result<()> {
        self.runner.run(
            &Cmd::new("mkfs.ext4")
                .args(["-L", "rootfs", "-O", "^huge_file"])
                .arg(partition)
                .privileged()
                .error_msg("mkfs.ext4 failed"),
        )?;
        Ok(())
    }

    /// Raw image write, 8 MiB blocks, synced before returning.
    pub fn write_raw(&self, image: &Path, target: &Path) -> Result<()> {
        self.runner.run(
            &Cmd::new("dd")
                .arg(format!("if={}", image.display()))
                .arg(format!("of={}", target.display()))
                .args(["bs=8M", "conv=fsync"])
                .privileged()
                .error_msg("dd failed"),
        )?;
        Ok(())
    }

    /// Raw image write into an already-sized image file: `conv=notrunc`
    /// keeps the planner-determined file length intact.
    pub fn splice_raw(&self, image: &Path, target: &Path) -> Result<()> {
        self.runner.run(
            &Cmd::new("dd")
                .arg(format!("if={}", image.display()))
                .arg(format!("of={}", target.display()))
                .args(["bs=8M", "conv=notrunc,fsync"])
                .privileged()
                .error_msg("dd failed"),
        )?;
        Ok(())
    }

    /// Overwrite the whole target with zeros before provisioning.
    ///
    /// `dd` exits non-zero when it runs off the end of the device; that
    /// is the expected way this operation terminates.
    pub fn zero_device(&self, target: &Path) -> Result<()> {
        self.runner.run(
            &Cmd::new("dd")
                .arg("if=/dev/zero")
                .arg(format!("of={}", target.display()))
                .args(["bs=8M", "conv=fsync"])
                .privileged()
                .allow_fail(),
        )?;
        Ok(())
    }

    /// Grow partition 2 to the end of the target and resize its
    /// filesystem into the new space.
    pub fn grow_root(&self, target: &Path, root_partition: &str) -> Result<()> {
        self.runner.run(
            &Cmd::new("parted")
                .arg_path(target)
                .args(["resizepart", "2", "100%"])
                .privileged()
                .error_msg("parted resizepart failed"),
        )?;
        self.runner.run(
            &Cmd::new("resize2fs")
                .arg(root_partition)
                .privileged()
                .error_msg("resize2fs failed"),
        )?;
        Ok(())
    }

    /// Extract a rootfs tar archive onto a mounted filesystem.
    pub fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.runner.run(
            &Cmd::new("tar")
                .arg("-xpf")
                .arg_path(archive)
                .arg("-C")
                .arg_path(dest)
                .privileged()
                .error_msg("rootfs extraction failed"),
        )?;
        Ok(())
    }

    /// Flush filesystem buffers for everything under the working
    /// directory.
    pub fn sync(&self) -> Result<()> {
        self.runner.run(&Cmd::new("sync").privileged())?;
        Ok(())
    }

    /// Mount a partition at a fixed working-directory mount point.
    pub fn mount(&mut self, source: &str, rel_mountpoint: &str, fstype: &str) -> Result<PathBuf> {
        let mountpoint = self.wd(rel_mountpoint);
        fs::create_dir_all(&mountpoint)?;
        self.runner.run(
            &Cmd::new("mount")
                .arg(source)
                .arg_path(&mountpoint)
                .args(["-t", fstype])
                .privileged()
                .error_msg("mount failed"),
        )?;
        self.mounts.push(mountpoint.clone());
        Ok(mountpoint)
    }

    /// Lazily unmount everything this session mounted, most recent
    /// first.
    pub fn unmount_all(&mut self) {
        while let Some(mountpoint) = self.mounts.pop() {
            lazy_umount(self.runner, &mountpoint);
        }
    }

    fn detach_loops(&mut self) {
        while let Some(device) = self.loops.pop() {
            let _ = self.runner.run(
                &Cmd::new("losetup")
                    .arg("-d")
                    .arg(&device)
                    .privileged()
                    .allow_fail(),
            );
        }
    }

    fn cleanup(&mut self) {
        self.unmount_all();
        self.detach_loops();
        if self.work_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.work_dir) {
                log::warn!(
                    "failed to remove working directory {}: {e}",
                    self.work_dir.display()
                );
            }
        }
        self.released = true;
    }

    /// End the session: unmount, detach, remove the working directory.
    pub fn release(mut self) -> Result<()> {
        log::info!("cleaning up...");
        self.cleanup();
        Ok(())
    }
}

impl Drop for DeviceSession<'_> {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("device session dropped without release; cleaning up");
            self.cleanup();
        }
    }
}
