//! Shared persistence utilities: atomic file writes, JSON load/save, fingerprints.
//!
//! Every file the crate writes (per-example gradient caches, cache manifests,
//! checkpoints, metrics tables) goes through the atomic write pattern: write to
//! a `.tmp` sibling, then rename over the target.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Incremental SHA-256 fingerprint over heterogeneous inputs.
///
/// Each `update_*` call is length-prefixed so that `("ab", "c")` and
/// `("a", "bc")` hash differently.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new(domain: &str) -> Self {
        let mut fp = Self::default();
        fp.update_str(domain);
        fp
    }

    pub fn update_str(&mut self, value: &str) -> &mut Self {
        self.update_bytes(value.as_bytes())
    }

    pub fn update_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn update_f64(&mut self, value: f64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn update_floats<'a>(&mut self, values: impl IntoIterator<Item = &'a f64>) -> &mut Self {
        let mut count = 0u64;
        for v in values {
            self.hasher.update(v.to_le_bytes());
            count += 1;
        }
        self.hasher.update(count.to_le_bytes());
        self
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        values: Vec<f64>,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("entry.json");

        let data = TestData {
            name: "grad".into(),
            values: vec![0.5, -1.25],
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<TestData> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!path.with_extension("tmp").exists());
    }

    /// Checkpoints and cached gradients must read back bit for bit.
    #[test]
    fn test_floats_survive_json_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("floats.json");
        let values = vec![
            -0.40384729887041293,
            0.1 + 0.2,
            std::f64::consts::PI / 3.0,
            1.0e-300 * 7.0,
            f64::MAX / 3.0,
        ];
        atomic_write_json(&path, &values).unwrap();
        let loaded: Vec<f64> = load_json(&path).unwrap().unwrap();
        for (a, b) in values.iter().zip(&loaded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_load_json_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<TestData> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_fingerprint_is_length_prefixed() {
        let mut a = Fingerprint::new("t");
        a.update_str("ab").update_str("c");
        let mut b = Fingerprint::new("t");
        b.update_str("a").update_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_fingerprint_sensitive_to_values() {
        let mut a = Fingerprint::new("params");
        a.update_floats(&[1.0, 2.0]);
        let mut b = Fingerprint::new("params");
        b.update_floats(&[1.0, 2.0 + 1e-12]);
        assert_ne!(a.finish(), b.finish());
    }
}
