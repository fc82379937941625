//! Error taxonomy for the provisioning pipeline.
//!
//! Every failure a caller can act on is a distinct variant; external tool
//! failures stay opaque (`Command`) because retrying a partially applied
//! filesystem operation is unsafe.

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the provisioning pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input could not be resolved from arguments or the
    /// environment. Raised before any destructive action.
    #[error("impossible to determine the {field}; pass --{field} or fix the environment")]
    MissingEnvironmentValue { field: String },

    /// Artifact integrity failure. Fatal for the session; the download is
    /// never retried automatically.
    #[error("invalid checksum for {}: expected {expected}, got {actual}", .path.display())]
    InvalidChecksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// No loop device could be obtained after bounded retries. A loop
    /// subsystem that stays dry is an environment fault, not contention.
    #[error("losetup returned no device after {attempts} attempts")]
    DeviceAcquisitionFailure { attempts: u32 },

    /// A working directory from a prior session still exists.
    #[error(
        "{} already exists! Is another provisioning session in progress? \
         If not, delete this directory and try again",
        .working_dir.display()
    )]
    ConcurrentBuild { working_dir: PathBuf },

    /// Discovery exceeded its deadline. The image write already succeeded;
    /// the operator should investigate the network, not re-provision.
    #[error("host `{hostname}` not reachable at {ip} after {}s", .waited.as_secs())]
    UnreachableHost {
        hostname: String,
        ip: String,
        waited: Duration,
    },

    /// Artifact download failure.
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    /// External tool failure (parted, mkfs, dd, ...). Opaque and fatal.
    #[error(transparent)]
    Command(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for the validation failure used throughout config
    /// generation.
    pub fn missing(field: &str) -> Self {
        Error::MissingEnvironmentValue {
            field: field.to_string(),
        }
    }
}

/// Fail with `MissingEnvironmentValue { field }` when `value` is `None` or
/// empty.
pub fn check_environment_value(field: &str, value: Option<&str>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(Error::missing(field)),
    }
}
