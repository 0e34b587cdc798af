//! Parameter snapshots and checkpoint files.

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::{Result, XaiError};
use crate::persistence::{Fingerprint, atomic_write_json, load_json};

/// A named parameter's shape and row-major values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl ParamTensor {
    pub fn from_array<D: Dimension>(array: &Array<f64, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Copy the values into `target`, which must have the same shape.
    pub fn assign_to<D: Dimension>(&self, target: &mut Array<f64, D>) -> Result<()> {
        if self.shape != target.shape() || self.data.len() != target.len() {
            return Err(XaiError::checkpoint(format!(
                "parameter shape {:?} does not match {:?}",
                self.shape,
                target.shape()
            )));
        }
        target
            .iter_mut()
            .zip(&self.data)
            .for_each(|(t, &v)| *t = v);
        Ok(())
    }
}

/// Ordered map from parameter name (`{layer}.weight`, `{layer}.bias`) to values.
pub type StateDict = BTreeMap<String, ParamTensor>;

/// How [`Classifier::load_state_dict`](super::Classifier::load_state_dict)
/// treats keys that do not line up with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Any missing or unexpected key is an error and nothing is loaded.
    #[default]
    Strict,
    /// Matching keys are loaded; the rest are logged and reported.
    Lenient,
}

/// Outcome of loading a state dict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    /// Fail if any parameter of `layer` was left at its previous value.
    pub fn require_layer(&self, layer: &str) -> Result<()> {
        let prefix = format!("{layer}.");
        let missing: Vec<_> = self
            .missing
            .iter()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(XaiError::checkpoint(format!(
                "checkpoint does not provide {}",
                missing.join(", ")
            )))
        }
    }
}

/// On-disk checkpoint: either a bare state dict, or one wrapped under
/// `state_dict` together with training metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointFile {
    Wrapped {
        state_dict: StateDict,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        global_step: Option<u64>,
    },
    Raw(StateDict),
}

impl CheckpointFile {
    pub fn into_state_dict(self) -> StateDict {
        match self {
            CheckpointFile::Wrapped { state_dict, .. } => state_dict,
            CheckpointFile::Raw(state_dict) => state_dict,
        }
    }
}

pub fn read_checkpoint(path: &Path) -> Result<StateDict> {
    let file: CheckpointFile = load_json(path)?.ok_or_else(|| {
        XaiError::not_found(format!("checkpoint {}", path.display()))
    })?;
    Ok(file.into_state_dict())
}

/// Write a wrapped checkpoint atomically.
pub fn write_checkpoint(path: &Path, state_dict: &StateDict, epoch: Option<u64>) -> Result<()> {
    let file = CheckpointFile::Wrapped {
        state_dict: state_dict.clone(),
        epoch,
        global_step: None,
    };
    atomic_write_json(path, &file)?;
    Ok(())
}

/// Feed every name, shape and value of `state` into `fp`.
pub fn fingerprint_state(fp: &mut Fingerprint, state: &StateDict) {
    fp.update_u64(state.len() as u64);
    for (name, tensor) in state {
        fp.update_str(name);
        fp.update_u64(tensor.shape.len() as u64);
        for &d in &tensor.shape {
            fp.update_u64(d as u64);
        }
        fp.update_floats(&tensor.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn state() -> StateDict {
        let mut s = StateDict::new();
        s.insert("out.weight".into(), ParamTensor::from_array(&array![[1.0, 2.0]]));
        s.insert("out.bias".into(), ParamTensor::from_array(&array![0.5]));
        s
    }

    #[test]
    fn test_wrapped_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epoch_1.ckpt");
        write_checkpoint(&path, &state(), Some(1)).unwrap();
        assert_eq!(read_checkpoint(&path).unwrap(), state());
    }

    #[test]
    fn test_raw_state_dict_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.json");
        std::fs::write(&path, serde_json::to_string(&state()).unwrap()).unwrap();
        assert_eq!(read_checkpoint(&path).unwrap(), state());
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_checkpoint(&dir.path().join("nope.ckpt")).unwrap_err();
        assert!(matches!(err, XaiError::NotFound(_)));
    }

    #[test]
    fn test_require_layer_reports_missing_keys() {
        let report = LoadReport {
            loaded: vec!["conv.weight".into()],
            missing: vec!["out.weight".into(), "out.bias".into()],
            unexpected: vec![],
        };
        assert!(report.require_layer("conv").is_ok());
        assert!(report.require_layer("out").is_err());
        assert!(!report.is_complete());
    }

    #[test]
    fn test_fingerprint_depends_on_values() {
        let mut a = Fingerprint::new("state");
        fingerprint_state(&mut a, &state());
        let mut changed = state();
        changed.get_mut("out.bias").unwrap().data[0] = 0.25;
        let mut b = Fingerprint::new("state");
        fingerprint_state(&mut b, &changed);
        assert_ne!(a.finish(), b.finish());
    }
}
