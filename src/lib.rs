//! Provisioning pipeline for TowerOS host media.
//!
//! This crate prepares the bootable media (an SD card or a loop-mounted
//! disk image) that turns a machine into a host of a tower system, then
//! confirms the host comes alive on the network:
//!
//! - **Checksummed artifacts** - download-if-absent, verify-always image
//!   cache
//! - **Partition planning** - deterministic aligned two-partition MBR
//!   layout
//! - **Device lifecycle** - loop devices, mounts, and guaranteed cleanup
//!   on every exit path
//! - **Host configuration** - identity, credentials, locale and network
//!   assignment, handed off through `tower.env` on the boot partition
//! - **Discovery** - bounded SSH polling that registers the new host
//!
//! # Architecture
//!
//! ```text
//! provision::Provisioner
//!     │
//!     ├── hostcfg     config synthesis and persisted records
//!     ├── artifact    verified image acquisition and cache
//!     ├── layout      partition arithmetic (pure)
//!     ├── device      loop/mount session with cleanup guarantee
//!     ├── discovery   SSH reachability polling
//!     └── sshconf     host registry and SSH client config
//! ```
//!
//! External tools (parted, mkfs, dd, losetup, ssh) are reached through
//! the [`process::Runner`] capability so the whole pipeline can run
//! against a scripted fake in tests.

pub mod artifact;
pub mod checksum;
pub mod device;
pub mod discovery;
pub mod error;
pub mod hostcfg;
pub mod layout;
pub mod network;
pub mod preflight;
pub mod process;
pub mod provision;
pub mod settings;
pub mod sshconf;
pub mod task;

pub use error::{Error, Result};
pub use hostcfg::HostConfig;
pub use provision::{Outcome, Provisioner, ProvisionRequest};
pub use settings::Settings;
