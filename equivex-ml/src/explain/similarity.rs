//! Example importance as representation similarity.

use ndarray::{Array1, Array2, Array4, Axis, concatenate, s};

use super::Explainer;
use crate::error::{Result, XaiError};
use crate::hooks::ActivationCapture;
use crate::model::Classifier;
use crate::tensor::pairwise_cosine;

/// Scores training example `j` for test example `i` with the cosine
/// similarity of their representations at a chosen layer.
pub struct RepresentationSimilarity<'m, M: Classifier + ?Sized> {
    model: &'m M,
    capture: ActivationCapture,
    h_train: Array2<f64>,
}

impl<'m, M: Classifier + ?Sized> RepresentationSimilarity<'m, M> {
    /// Captures the training representations once, in batches.
    pub fn new(model: &'m M, layer: &str, x_train: &Array4<f64>, batch_size: usize) -> Result<Self> {
        let capture = ActivationCapture::attach(model, layer)?;
        let h_train = capture_batched(&capture, model, x_train, batch_size)?;
        tracing::debug!(layer, train = h_train.nrows(), features = h_train.ncols(), "captured train representations");
        Ok(Self {
            model,
            capture,
            h_train,
        })
    }

    pub fn train_representations(&self) -> &Array2<f64> {
        &self.h_train
    }
}

/// Run `x` through `model` in batches and stack the captured rows.
pub(crate) fn capture_batched<M: Classifier + ?Sized>(
    capture: &ActivationCapture,
    model: &M,
    x: &Array4<f64>,
    batch_size: usize,
) -> Result<Array2<f64>> {
    let n = x.dim().0;
    let size = batch_size.max(1);
    let mut parts = Vec::new();
    for start in (0..n).step_by(size) {
        let end = (start + size).min(n);
        let batch = x.slice(s![start..end, .., .., ..]).to_owned();
        parts.push(capture.capture(model, &batch)?);
    }
    if parts.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| XaiError::shape(e.to_string()))
}

impl<M: Classifier + ?Sized> Explainer for RepresentationSimilarity<'_, M> {
    fn name(&self) -> &str {
        "Representation Similarity"
    }

    fn attribute(&mut self, x: &Array4<f64>, _y: &Array1<usize>) -> Result<Array2<f64>> {
        let h = self.capture.capture(self.model, x)?;
        pairwise_cosine(&h, &self.h_train)
    }
}
