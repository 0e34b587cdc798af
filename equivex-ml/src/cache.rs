//! Per-training-example cache of precomputed gradients and inverse-HVPs.
//!
//! Entries live next to a `manifest.json` recording a fingerprint of everything
//! they were computed from. The manifest is written last, so an interrupted
//! precomputation leaves the cache [`CacheStatus::Missing`] rather than half
//! valid.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, XaiError};
use crate::persistence::{atomic_write_json, load_json};

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Per-checkpoint loss gradients, one row per checkpoint.
    Grad,
    /// Inverse Hessian-vector products, one row.
    Ihvp,
}

impl CacheKind {
    fn stem(self) -> &'static str {
        match self {
            CacheKind::Grad => "train_grad",
            CacheKind::Ihvp => "train_ihvp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub fingerprint: String,
    pub kind: CacheKind,
    pub entries: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Missing,
    /// Present, but computed from different inputs or incomplete.
    Stale,
    Fresh,
}

pub struct GradientCache {
    dir: PathBuf,
    kind: CacheKind,
    fingerprint: String,
}

impl GradientCache {
    pub fn new(dir: impl Into<PathBuf>, kind: CacheKind, fingerprint: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            kind,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// `train_grad{index}.json` or `train_ihvp{index}.json`.
    pub fn entry_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}{index}.json", self.kind.stem()))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST)
    }

    pub fn status(&self, entries: usize) -> Result<CacheStatus> {
        let manifest: Option<CacheManifest> = match load_json(&self.manifest_path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "unreadable cache manifest");
                return Ok(CacheStatus::Stale);
            }
        };
        let Some(manifest) = manifest else {
            return Ok(CacheStatus::Missing);
        };
        if manifest.fingerprint != self.fingerprint
            || manifest.kind != self.kind
            || manifest.entries != entries
            || (0..entries).any(|i| !self.entry_path(i).exists())
        {
            return Ok(CacheStatus::Stale);
        }
        Ok(CacheStatus::Fresh)
    }

    /// Whether `entries` cached values can be reused. A stale cache is
    /// invalidated so the caller recomputes from scratch.
    pub fn prepare(&self, entries: usize) -> Result<bool> {
        match self.status(entries)? {
            CacheStatus::Fresh => {
                tracing::info!(dir = %self.dir.display(), entries, "reusing cached {:?} values", self.kind);
                Ok(true)
            }
            CacheStatus::Stale => {
                tracing::warn!(dir = %self.dir.display(), "cache is stale, recomputing");
                self.invalidate()?;
                Ok(false)
            }
            CacheStatus::Missing => Ok(false),
        }
    }

    pub fn store(&self, index: usize, values: &Array2<f64>) -> Result<()> {
        atomic_write_json(&self.entry_path(index), values)?;
        Ok(())
    }

    pub fn load(&self, index: usize) -> Result<Array2<f64>> {
        load_json(&self.entry_path(index))?.ok_or_else(|| {
            XaiError::cache(format!(
                "missing cache entry {}",
                self.entry_path(index).display()
            ))
        })
    }

    /// Record that all `entries` values are stored.
    pub fn finalize(&self, entries: usize) -> Result<()> {
        let manifest = CacheManifest {
            fingerprint: self.fingerprint.clone(),
            kind: self.kind,
            entries,
            created_at: Utc::now(),
        };
        atomic_write_json(&self.manifest_path(), &manifest)?;
        Ok(())
    }

    /// Delete the manifest and every entry file of this cache's kind.
    pub fn invalidate(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let manifest = self.manifest_path();
        if manifest.exists() {
            std::fs::remove_file(&manifest)?;
        }
        let stem = self.kind.stem();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_entry = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(stem))
                .and_then(|rest| rest.strip_suffix(".json"))
                .is_some_and(|idx| idx.parse::<usize>().is_ok());
            if is_entry {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn filled(dir: &Path, fingerprint: &str) -> GradientCache {
        let cache = GradientCache::new(dir, CacheKind::Grad, fingerprint);
        cache.store(0, &array![[1.0, 2.0]]).unwrap();
        cache.store(1, &array![[3.0, 4.0]]).unwrap();
        cache.finalize(2).unwrap();
        cache
    }

    #[test]
    fn test_entry_naming() {
        let cache = GradientCache::new("/tmp/c", CacheKind::Ihvp, "f");
        assert_eq!(cache.entry_path(7), PathBuf::from("/tmp/c/train_ihvp7.json"));
    }

    #[test]
    fn test_fresh_after_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let cache = filled(dir.path(), "abc");
        assert_eq!(cache.status(2).unwrap(), CacheStatus::Fresh);
        assert_eq!(cache.load(1).unwrap(), array![[3.0, 4.0]]);
    }

    #[test]
    fn test_missing_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GradientCache::new(dir.path(), CacheKind::Grad, "abc");
        cache.store(0, &array![[1.0]]).unwrap();
        assert_eq!(cache.status(1).unwrap(), CacheStatus::Missing);
    }

    #[test]
    fn test_fingerprint_change_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        filled(dir.path(), "abc");
        let other = GradientCache::new(dir.path(), CacheKind::Grad, "xyz");
        assert_eq!(other.status(2).unwrap(), CacheStatus::Stale);
        assert!(!other.prepare(2).unwrap());
        assert_eq!(other.status(2).unwrap(), CacheStatus::Missing);
        assert!(!other.entry_path(0).exists());
    }

    #[test]
    fn test_entry_count_change_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cache = filled(dir.path(), "abc");
        assert_eq!(cache.status(3).unwrap(), CacheStatus::Stale);
    }

    #[test]
    fn test_invalidate_keeps_other_kind() {
        let dir = tempfile::tempdir().unwrap();
        let grads = filled(dir.path(), "abc");
        let ihvp = GradientCache::new(dir.path(), CacheKind::Ihvp, "abc");
        ihvp.store(0, &array![[5.0]]).unwrap();
        grads.invalidate().unwrap();
        assert!(!grads.entry_path(0).exists());
        assert!(ihvp.entry_path(0).exists());
    }
}
