//! Classifier capability interface and the built-in sequential models.
//!
//! Every attribution engine and measurement works against [`Classifier`]: a
//! forward pass, the penultimate representation, a designated last layer whose
//! parameters gradient-based engines differentiate, input gradients for
//! gradient attributions, named layers for hook
//! capture, and state-dict load/store for checkpoint replay.

pub mod layers;
pub mod sequential;
pub mod state;

pub use layers::{Conv2d, DihedralLift, Layer, Linear, LinearVars, TapedShape};
pub use sequential::{Architecture, Sequential};
pub use state::{
    CheckpointFile, LoadMode, LoadReport, ParamTensor, StateDict, fingerprint_state,
    read_checkpoint, write_checkpoint,
};

use ndarray::{Array1, Array2, Array4};

use crate::error::Result;
use crate::hooks::HookRegistry;
use crate::tensor::argmax;

/// A classifier producing logits for a batch of inputs.
pub trait Classifier {
    /// Logits `(batch, classes)`. Every layer output is offered to
    /// [`Classifier::hooks`].
    fn forward(&self, x: &Array4<f64>) -> Result<Array2<f64>>;

    /// Input of the last layer, `(batch, features)`.
    fn penultimate(&self, x: &Array4<f64>) -> Result<Array2<f64>>;

    fn last_layer(&self) -> &Linear;

    fn last_layer_name(&self) -> &str;

    fn named_layer(&self, name: &str) -> Result<&Layer>;

    fn layer_names(&self) -> Vec<&str>;

    fn hooks(&self) -> &HookRegistry;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict, mode: LoadMode) -> Result<LoadReport>;

    /// Gradient of the logit of class `targets[i]` with respect to example
    /// `i`, shaped like `x`. Hooks are not triggered.
    fn input_gradients(&self, x: &Array4<f64>, targets: &[usize]) -> Result<Array4<f64>>;

    fn num_classes(&self) -> usize {
        self.last_layer().out_features()
    }

    /// Predicted class per example.
    fn predict(&self, x: &Array4<f64>) -> Result<Array1<usize>> {
        let logits = self.forward(x)?;
        Ok(logits.rows().into_iter().map(argmax).collect())
    }
}
