//! Preflight checks for the provisioning host.
//!
//! Validates that the thin client has the external tools the device
//! phase shells out to, before anything is written. This prevents
//! cryptic mid-pipeline errors against a half-provisioned target.

use anyhow::anyhow;

use crate::error::{Error, Result};

/// Host tools the device phase depends on, as (command, package) pairs.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("parted", "parted"),
    ("mkdosfs", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("losetup", "util-linux"),
    ("lsblk", "util-linux"),
    ("dd", "coreutils"),
    ("tar", "tar"),
    ("xz", "xz"),
    ("ssh", "openssh"),
    ("ssh-keygen", "openssh"),
];

/// Check if a command is resolvable in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available; the error lists every
/// missing one with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }

    if !missing.is_empty() {
        return Err(Error::Command(anyhow!(
            "Missing required host tools:\n{}",
            missing.join("\n")
        )));
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
