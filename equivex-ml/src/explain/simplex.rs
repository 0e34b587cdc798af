//! SimplEx: explain a test representation as a convex mixture of training
//! representations.

use ndarray::{Array1, Array2, Array4};

use super::Explainer;
use super::similarity::capture_batched;
use crate::autograd::{Adam, Tape, softmax_rows};
use crate::error::{Result, XaiError};
use crate::hooks::ActivationCapture;
use crate::model::Classifier;

pub const DEFAULT_EPOCHS: usize = 1000;
pub const DEFAULT_LR: f64 = 1e-3;

/// Residual trajectory of the last weight fit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimplexDiagnostics {
    /// `(epoch, ‖W H_train − H‖²)` every `record_every` epochs, plus the
    /// final residual.
    pub residuals: Vec<(usize, f64)>,
}

pub struct SimplEx<'m, M: Classifier + ?Sized> {
    model: &'m M,
    capture: ActivationCapture,
    h_train: Array2<f64>,
    epochs: usize,
    lr: f64,
    record_every: Option<usize>,
    diagnostics: Option<SimplexDiagnostics>,
}

impl<'m, M: Classifier + ?Sized> SimplEx<'m, M> {
    pub fn new(model: &'m M, layer: &str, x_train: &Array4<f64>, batch_size: usize) -> Result<Self> {
        let capture = ActivationCapture::attach(model, layer)?;
        let h_train = capture_batched(&capture, model, x_train, batch_size)?;
        Ok(Self {
            model,
            capture,
            h_train,
            epochs: DEFAULT_EPOCHS,
            lr: DEFAULT_LR,
            record_every: None,
            diagnostics: None,
        })
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Record the residual every `every` epochs. Does not change the weights.
    pub fn with_diagnostics(mut self, every: usize) -> Self {
        self.record_every = Some(every.max(1));
        self
    }

    pub fn diagnostics(&self) -> Option<&SimplexDiagnostics> {
        self.diagnostics.as_ref()
    }
}

/// Fit softmax-parametrised mixture weights `(n, n_train)` so that
/// `W H_train ≈ H`. Pre-weights start at zero, i.e. uniform weights.
pub fn fit_weights(
    h: &Array2<f64>,
    h_train: &Array2<f64>,
    epochs: usize,
    lr: f64,
    record_every: Option<usize>,
) -> Result<(Array2<f64>, SimplexDiagnostics)> {
    if h.ncols() != h_train.ncols() {
        return Err(XaiError::shape(format!(
            "test representations have {} features, train {}",
            h.ncols(),
            h_train.ncols()
        )));
    }
    if h_train.nrows() == 0 {
        return Err(XaiError::invalid_input("SimplEx needs at least one training example"));
    }

    let mut preweights = vec![Array2::<f64>::zeros((h.nrows(), h_train.nrows()))];
    let mut optimizer = Adam::default_params(lr);
    let mut diagnostics = SimplexDiagnostics::default();

    for epoch in 0..epochs {
        let tape = Tape::new();
        let p = tape.leaf(preweights[0].clone());
        let approx = softmax_rows(&p).matmul(&tape.constant(h_train.clone()));
        let diff = &approx - &tape.constant(h.clone());
        let error = (&diff * &diff).sum();
        if record_every.is_some_and(|every| epoch % every == 0) {
            diagnostics.residuals.push((epoch, error.scalar()));
        }
        let grads = tape.grad(&error, std::slice::from_ref(&p))?;
        optimizer.step(&mut preweights, &[grads[0].value()])?;
    }

    let tape = Tape::new();
    let weights = softmax_rows(&tape.leaf(preweights[0].clone())).value();
    if record_every.is_some() {
        let residual = (weights.dot(h_train) - h).mapv(|v| v * v).sum();
        diagnostics.residuals.push((epochs, residual));
    }
    Ok((weights, diagnostics))
}

impl<M: Classifier + ?Sized> Explainer for SimplEx<'_, M> {
    fn name(&self) -> &str {
        "SimplEx"
    }

    fn attribute(&mut self, x: &Array4<f64>, _y: &Array1<usize>) -> Result<Array2<f64>> {
        let h = self.capture.capture(self.model, x)?;
        let (weights, diagnostics) =
            fit_weights(&h, &self.h_train, self.epochs, self.lr, self.record_every)?;
        if let Some(last) = diagnostics.residuals.last() {
            tracing::debug!(epochs = self.epochs, residual = last.1, "fitted SimplEx weights");
        }
        if self.record_every.is_some() {
            self.diagnostics = Some(diagnostics);
        }
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::shifted_patterns;
    use crate::model::Sequential;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn assert_simplex_rows(w: &Array2<f64>) {
        for row in w.rows() {
            assert!(row.iter().all(|&v| v >= 0.0));
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_zero_epochs_gives_uniform_weights() {
        let h_train = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let (w, _) = fit_weights(&array![[0.2, 0.3]], &h_train, 0, DEFAULT_LR, None).unwrap();
        assert_simplex_rows(&w);
        assert_abs_diff_eq!(w[[0, 2]], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_weights_move_toward_matching_example() {
        let h_train = array![[1.0, 0.0], [0.0, 1.0]];
        let (w, diag) = fit_weights(&array![[1.0, 0.0]], &h_train, 300, 0.05, Some(50)).unwrap();
        assert_simplex_rows(&w);
        assert!(w[[0, 0]] > 0.9);
        let first = diag.residuals.first().unwrap().1;
        let last = diag.residuals.last().unwrap().1;
        assert!(last < first);
    }

    #[test]
    fn test_diagnostics_do_not_change_weights() {
        let h_train = array![[1.0, 2.0], [0.5, -1.0], [0.0, 0.3]];
        let h = array![[0.4, 0.1], [1.0, 1.0]];
        let (a, _) = fit_weights(&h, &h_train, 40, 0.01, None).unwrap();
        let (b, _) = fit_weights(&h, &h_train, 40, 0.01, Some(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_explainer_rows_on_model() {
        let data = shifted_patterns(5, 2, 8, 0.1, 1).unwrap();
        let model = Sequential::mlp(8, &[4], 2, 3);
        let mut explainer = SimplEx::new(&model, "fc1", &data.x, 2).unwrap().with_epochs(20);
        let w = explainer.attribute(&data.x, &data.y).unwrap();
        assert_eq!(w.dim(), (5, 5));
        assert_simplex_rows(&w);
    }
}
