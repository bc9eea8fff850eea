//! SHA-256 sidecars for cached dataset files.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// State of a cached file relative to its `<path>.sha256` sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheIntegrity {
    /// No cache file.
    Missing,
    /// Cache file without a sidecar.
    NoChecksum,
    Valid,
    /// Content no longer matches the recorded digest.
    Mismatch,
}

impl CacheIntegrity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheIntegrity::Missing => "missing",
            CacheIntegrity::NoChecksum => "no-checksum",
            CacheIntegrity::Valid => "valid",
            CacheIntegrity::Mismatch => "mismatch",
        }
    }
}

pub fn checksum_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    PathBuf::from(sidecar)
}

/// Lower-case hex SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

pub fn verify_cache_integrity(path: &Path) -> io::Result<CacheIntegrity> {
    if !path.exists() {
        return Ok(CacheIntegrity::Missing);
    }
    let sidecar = checksum_path(path);
    if !sidecar.exists() {
        return Ok(CacheIntegrity::NoChecksum);
    }
    let recorded = std::fs::read_to_string(&sidecar)?;
    let actual = sha256_hex(&std::fs::read(path)?);
    if recorded.trim().eq_ignore_ascii_case(&actual) {
        Ok(CacheIntegrity::Valid)
    } else {
        Ok(CacheIntegrity::Mismatch)
    }
}

/// Record the digest of the file's current content.
pub fn write_checksum(path: &Path) -> io::Result<String> {
    let digest = sha256_hex(&std::fs::read(path)?);
    std::fs::write(checksum_path(path), &digest)?;
    Ok(digest)
}

/// Write `content` and its sidecar.
pub fn write_with_checksum(path: &Path, content: &str) -> io::Result<String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    let digest = sha256_hex(content.as_bytes());
    std::fs::write(checksum_path(path), &digest)?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn integrity_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gsm8k.json");
        assert_eq!(verify_cache_integrity(&path).unwrap(), CacheIntegrity::Missing);

        write_with_checksum(&path, "[{\"id\":\"q1\"}]").unwrap();
        assert_eq!(verify_cache_integrity(&path).unwrap(), CacheIntegrity::Valid);
        assert_eq!(checksum_path(&path), dir.path().join("gsm8k.json.sha256"));

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[3] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();
        assert_eq!(verify_cache_integrity(&path).unwrap(), CacheIntegrity::Mismatch);

        std::fs::remove_file(checksum_path(&path)).unwrap();
        assert_eq!(verify_cache_integrity(&path).unwrap(), CacheIntegrity::NoChecksum);

        write_checksum(&path).unwrap();
        assert_eq!(verify_cache_integrity(&path).unwrap(), CacheIntegrity::Valid);
    }
}
