//! Differentiable losses built on the tape.

use ndarray::{Array2, Axis};

use super::tape::Var;
use crate::error::{Result, XaiError};

/// Row-wise softmax, `(n, k) -> (n, k)`.
pub fn softmax_rows(logits: &Var) -> Var {
    let tape = logits.tape();
    let (_, k) = logits.shape();
    let shifted = logits - &tape.constant(row_max(&logits.value()));
    let e = shifted.exp();
    let norm = e.sum_rows().recip().broadcast_cols(k);
    &e * &norm
}

/// Mean softmax cross entropy of `(n, k)` logits against class labels.
pub fn cross_entropy(logits: &Var, labels: &[usize]) -> Result<Var> {
    let (n, k) = logits.shape();
    if n == 0 {
        return Err(XaiError::invalid_input("cross entropy over an empty batch"));
    }
    if labels.len() != n {
        return Err(XaiError::shape(format!(
            "cross entropy got {n} rows of logits but {} labels",
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= k) {
        return Err(XaiError::invalid_input(format!(
            "label {bad} out of range for {k} classes"
        )));
    }

    let tape = logits.tape();
    let shifted = logits - &tape.constant(row_max(&logits.value()));
    let log_norm = shifted.exp().sum_rows().ln();
    let one_hot = Array2::from_shape_fn((n, k), |(i, j)| if labels[i] == j { 1.0 } else { 0.0 });
    let picked = (&shifted * &tape.constant(one_hot)).sum_rows();
    Ok((&log_norm - &picked).sum().scale(1.0 / n as f64))
}

/// Quadratic form `½ θᵀ A θ` for a column `θ`.
pub fn quadratic_form(theta: &Var, a: &Array2<f64>) -> Result<Var> {
    let (p, one) = theta.shape();
    if one != 1 || a.dim() != (p, p) {
        return Err(XaiError::shape(format!(
            "quadratic form needs a ({p}, 1) column and a ({p}, {p}) matrix, got {:?} and {:?}",
            theta.shape(),
            a.dim()
        )));
    }
    let a = theta.tape().constant(a.clone());
    Ok((theta * &a.matmul(theta)).sum().scale(0.5))
}

/// Row maxima broadcast back to the input shape. Used as a constant shift for
/// numerically stable exponentials.
fn row_max(values: &Array2<f64>) -> Array2<f64> {
    let (n, k) = values.dim();
    let maxima = values.map_axis(Axis(1), |row| {
        row.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    });
    Array2::from_shape_fn((n, k), |(i, _)| maxima[i])
}
