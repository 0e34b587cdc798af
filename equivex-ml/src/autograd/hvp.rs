//! Hessian-vector products by double backpropagation.

use ndarray::{Array1, Array2};

use super::tape::{Tape, Var};
use crate::error::{Result, XaiError};

/// Multiply the Hessian of `loss` with respect to `params` by `v`.
///
/// `v` is laid out like [`flatten_vars`] lays out `params`: each parameter
/// flattened row-major, concatenated in order.
///
/// 1. first backward pass with the graph kept;
/// 2. scalar `Σ ⟨∂loss/∂θᵢ, vᵢ⟩` recorded on the tape;
/// 3. second backward pass of that scalar.
///
/// Cost is linear in the parameter count. Every node recorded during the call
/// is dropped from the tape before returning, so repeated calls against the
/// same loss do not accumulate graph state.
pub fn hessian_vector_product(
    tape: &Tape,
    loss: &Var,
    params: &[Var],
    v: &Array1<f64>,
) -> Result<Array1<f64>> {
    let expected: usize = params.iter().map(|p| p.shape().0 * p.shape().1).sum();
    if v.len() != expected {
        return Err(XaiError::shape(format!(
            "hvp vector has {} entries, parameters have {expected}",
            v.len()
        )));
    }

    let mark = tape.len();
    let result = (|| -> Result<Array1<f64>> {
        let first = tape.grad(loss, params)?;

        let mut offset = 0;
        let mut dot: Option<Var> = None;
        for g in &first {
            let (rows, cols) = g.shape();
            let chunk = v.slice(ndarray::s![offset..offset + rows * cols]);
            offset += rows * cols;
            let chunk = Array2::from_shape_vec((rows, cols), chunk.to_vec())
                .map_err(|e| XaiError::shape(e.to_string()))?;
            let term = (g * &tape.constant(chunk)).sum();
            dot = Some(match dot {
                Some(acc) => &acc + &term,
                None => term,
            });
        }
        let Some(dot) = dot else {
            return Ok(Array1::zeros(0));
        };

        let second = tape.grad(&dot, params)?;
        Ok(flatten_vars(&second))
    })();
    tape.truncate(mark);
    result
}

/// Concatenate the row-major values of several vars into one vector.
pub fn flatten_vars(vars: &[Var]) -> Array1<f64> {
    let mut out = Vec::new();
    for v in vars {
        out.extend(v.value().iter().copied());
    }
    Array1::from(out)
}
