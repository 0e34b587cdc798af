//! Ordered replay of saved parameter snapshots into a live model.

use std::path::{Path, PathBuf};

use crate::error::{Result, XaiError};
use crate::model::{Classifier, LoadMode, StateDict, fingerprint_state, read_checkpoint};
use crate::persistence::Fingerprint;

/// Walks a checkpoint set in order, loading each snapshot into the model.
///
/// The state before the first load is kept so [`CheckpointReplay::restore`]
/// can put the model back once a pass is over.
pub struct CheckpointReplay {
    checkpoints: Vec<PathBuf>,
    mode: LoadMode,
    current: Option<usize>,
    original: Option<StateDict>,
}

impl CheckpointReplay {
    pub fn new(checkpoints: Vec<PathBuf>, mode: LoadMode) -> Result<Self> {
        if checkpoints.is_empty() {
            return Err(XaiError::checkpoint("checkpoint set is empty"));
        }
        Ok(Self {
            checkpoints,
            mode,
            current: None,
            original: None,
        })
    }

    /// Every `*.{extension}` file in `dir`, sorted by file name.
    pub fn from_dir(dir: &Path, extension: &str, mode: LoadMode) -> Result<Self> {
        let mut checkpoints: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension))
            .collect();
        checkpoints.sort();
        Self::new(checkpoints, mode)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    /// Index of the snapshot currently loaded, if any.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Load snapshot `index`. The last layer must be fully provided even in
    /// lenient mode.
    pub fn load<M: Classifier + ?Sized>(&mut self, model: &mut M, index: usize) -> Result<()> {
        let path = self.checkpoints.get(index).ok_or_else(|| {
            XaiError::checkpoint(format!(
                "checkpoint {index} out of range for {} snapshots",
                self.checkpoints.len()
            ))
        })?;
        if self.original.is_none() {
            self.original = Some(model.state_dict());
        }
        let state = read_checkpoint(path)?;
        let report = model.load_state_dict(&state, self.mode)?;
        report.require_layer(model.last_layer_name())?;
        tracing::debug!(checkpoint = %path.display(), loaded = report.loaded.len(), "replayed checkpoint");
        self.current = Some(index);
        Ok(())
    }

    /// Put back the parameters the model had before the first load.
    pub fn restore<M: Classifier + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        if let Some(original) = self.original.take() {
            model.load_state_dict(&original, LoadMode::Strict)?;
        }
        self.current = None;
        Ok(())
    }

    /// Hash of every snapshot's contents, in replay order.
    pub fn fingerprint(&self, fp: &mut Fingerprint) -> Result<()> {
        fp.update_u64(self.checkpoints.len() as u64);
        for path in &self.checkpoints {
            fingerprint_state(fp, &read_checkpoint(path)?);
        }
        Ok(())
    }
}
