//! File integrity verification against known SHA-256 digests.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};

/// Streamed SHA-256 of a file. Returns the lowercase hex digest and the
/// file length in bytes.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Compare the file's digest to `expected` (lowercase hex).
///
/// Never mutates the file; deterministic and idempotent. A mismatch is
/// [`Error::InvalidChecksum`] carrying both digests.
pub fn verify(path: &Path, expected: &str) -> Result<()> {
    log::info!("checking {} checksum...", path.display());
    let (actual, _) = sha256_file(path)?;
    if actual != expected.to_ascii_lowercase() {
        return Err(Error::InvalidChecksum {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // sha256("hello")
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn sha256_file_matches_known_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();

        let (digest, size) = sha256_file(&path).unwrap();
        assert_eq!(digest, HELLO_SHA256);
        assert_eq!(size, 5);
    }

    #[test]
    fn verify_accepts_matching_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();

        verify(&path, HELLO_SHA256).unwrap();
        // idempotent, file untouched
        verify(&path, HELLO_SHA256).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn verify_rejects_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        fs::write(&path, b"tampered").unwrap();

        let err = verify(&path, HELLO_SHA256).unwrap_err();
        match err {
            Error::InvalidChecksum {
                path: p,
                expected,
                actual,
            } => {
                assert_eq!(p, path);
                assert_eq!(expected, HELLO_SHA256);
                assert_ne!(actual, expected);
            }
            other => panic!("expected InvalidChecksum, got {other:?}"),
        }
    }
}
