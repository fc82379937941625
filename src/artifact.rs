//! Build artifact acquisition: download if absent, verify always, cache
//! by filename.
//!
//! Artifacts the pipeline depends on are pinned by name, filename, source
//! URL and SHA-256. A cached file that fails verification is a hard
//! error, never a silent re-download; a verified cached file costs zero
//! network I/O.

use anyhow::Context;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use walkdir::WalkDir;

use crate::checksum;
use crate::error::{Error, Result};
use crate::process::{Cmd, Runner};

/// Pinned description of a required artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSpec {
    pub name: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
}

/// Release pins for the artifacts a provisioning session may need.
pub const REQUIRED_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec {
        name: "toweros-host",
        filename: "toweros-host-rpi4-0.1.0.img.xz",
        url: "https://builds.towercomputing.org/0.1.0/toweros-host-rpi4-0.1.0.img.xz",
        sha256: "9c3f1a0e62d3c2b8a7f4d90355e8c1d6740bb2fa8e1c9d0b5a6f3e2d1c0b9a84",
    },
    ArtifactSpec {
        name: "alpine-rpi",
        filename: "alpine-rpi-3.20.3-armv7.tar.gz",
        url: "https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/armv7/alpine-rpi-3.20.3-armv7.tar.gz",
        sha256: "46d0b0eab48e6d9fe70b05a0e7bc4038ef0e1ec20ec5437ca2b715a54ec0ad30",
    },
];

/// A locally present, checksum-verified artifact. Immutable once
/// verified; destroyed only by manual cache cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub name: String,
    pub filename: String,
    pub url: String,
    pub sha256: String,
    pub path: PathBuf,
    pub verified: bool,
}

/// Capability for fetching a URL into a file, injectable for tests.
pub trait Downloader {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Network timeout covering the whole artifact transfer.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Blocking HTTP downloader backed by `ureq`.
pub struct HttpDownloader;

fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(DOWNLOAD_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

impl Downloader for HttpDownloader {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let response = http_agent().get(url).call().map_err(|e| Error::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let mut file = File::create(dest)?;
        io::copy(&mut response.into_body().as_reader(), &mut file)?;
        Ok(())
    }
}

/// Resolve the artifact cache directory.
///
/// Order: caller-supplied path, else `./dist`, else `./builds`, else the
/// user cache fallback (created if needed).
pub fn resolve_cache_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
        }
        return Ok(dir.to_path_buf());
    }
    for candidate in [PathBuf::from("dist"), PathBuf::from("builds")] {
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    let fallback = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tower")
        .join("builds");
    if !fallback.is_dir() {
        fs::create_dir_all(&fallback)?;
    }
    Ok(fallback)
}

/// Acquires artifacts into a cache directory.
pub struct ArtifactFetcher<'a> {
    cache_dir: PathBuf,
    downloader: &'a dyn Downloader,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(cache_dir: PathBuf, downloader: &'a dyn Downloader) -> Self {
        Self {
            cache_dir,
            downloader,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Acquire a pinned artifact by name: download when absent, verify
    /// always.
    pub fn acquire(&self, name: &str) -> Result<BuildArtifact> {
        let spec = REQUIRED_ARTIFACTS
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::missing("image"))?;
        self.acquire_spec(spec)
    }

    pub fn acquire_spec(&self, spec: &ArtifactSpec) -> Result<BuildArtifact> {
        let path = self.cache_dir.join(spec.filename);

        if !path.is_file() {
            log::info!("{} not found in {}", spec.filename, self.cache_dir.display());
            let _lock = self.lock_download(spec.filename)?;
            // A concurrent fetcher may have finished while we waited.
            if !path.is_file() {
                self.download(spec, &path)?;
            }
        }

        checksum::verify(&path, spec.sha256)?;

        Ok(BuildArtifact {
            name: spec.name.to_string(),
            filename: spec.filename.to_string(),
            url: spec.url.to_string(),
            sha256: spec.sha256.to_string(),
            path,
            verified: true,
        })
    }

    /// Whole-file download through a temporary path. The final filename
    /// only ever appears once the transfer is complete, so a partial
    /// download can never claim completion.
    fn download(&self, spec: &ArtifactSpec, dest: &Path) -> Result<()> {
        log::info!("downloading {}...", spec.url);
        let partial = dest.with_extension("part");
        if let Err(e) = self.downloader.fetch(spec.url, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, dest)?;
        Ok(())
    }

    fn lock_download(&self, filename: &str) -> Result<File> {
        let lock_path = self.cache_dir.join(format!(".{filename}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))
            .map_err(Error::Command)?;
        Ok(lock)
    }
}

/// Scan the cache directories for a host image (`toweros-host-*.img` or
/// `*.img.xz`). The lexicographically last name wins, matching the
/// version-stamped filename scheme.
pub fn find_host_image(override_dir: Option<&Path>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = vec![PathBuf::from("dist"), PathBuf::from("builds")];
    if let Some(cache) = dirs::cache_dir() {
        candidates.push(cache.join("tower").join("builds"));
    }
    if let Some(dir) = override_dir {
        candidates.insert(0, dir.to_path_buf());
    }

    for dir in candidates {
        if !dir.is_dir() {
            continue;
        }
        let mut images: Vec<PathBuf> = WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| is_host_image(p))
            .collect();
        images.sort();
        if let Some(image) = images.pop() {
            return Some(image);
        }
    }
    None
}

fn is_host_image(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with("toweros-host-") && (name.ends_with(".img") || name.ends_with(".img.xz"))
}

/// Decompress an `.xz` image next to its source, through the external
/// `xz` tool. Paths without the `.xz` suffix pass through unchanged, and
/// an already-decompressed sibling is reused.
pub fn prepare_host_image(image_path: &Path, runner: &dyn Runner) -> Result<PathBuf> {
    let Some(name) = image_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(image_path.to_path_buf());
    };
    if !name.ends_with(".xz") {
        return Ok(image_path.to_path_buf());
    }

    let out_path = image_path.with_file_name(name.trim_end_matches(".xz"));
    if out_path.is_file() {
        return Ok(out_path);
    }

    log::info!("decompressing {}...", image_path.display());
    runner.run(
        &Cmd::new("xz")
            .args(["--decompress", "--keep", "--force"])
            .arg_path(image_path)
            .error_msg("xz decompression failed"),
    )?;
    Ok(out_path)
}
