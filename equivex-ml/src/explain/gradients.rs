//! Loss gradients and Hessian-vector products with respect to the last layer.
//!
//! Parameters are flattened as the weight (row-major, `(out, in)`) followed by
//! the bias.

use ndarray::{Array1, Array2, Array4, ArrayView1, Axis, concatenate, s};

use crate::autograd::{Tape, cross_entropy, flatten_vars, hessian_vector_product};
use crate::error::{Result, XaiError};
use crate::model::{Classifier, Linear};

/// Penultimate features of `x`, computed `batch_size` examples at a time.
pub fn penultimate_batched<M: Classifier + ?Sized>(
    model: &M,
    x: &Array4<f64>,
    batch_size: usize,
) -> Result<Array2<f64>> {
    let n = x.dim().0;
    let size = batch_size.max(1);
    let mut parts = Vec::new();
    for start in (0..n).step_by(size) {
        let end = (start + size).min(n);
        parts.push(model.penultimate(&x.slice(s![start..end, .., .., ..]).to_owned())?);
    }
    if parts.is_empty() {
        return Ok(Array2::zeros((0, model.last_layer().in_features())));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| XaiError::shape(e.to_string()))
}

/// Flattened last-layer parameters.
pub fn flatten_linear(layer: &Linear) -> Array1<f64> {
    layer.weight.iter().chain(layer.bias.iter()).copied().collect()
}

/// Gradient of the cross entropy of one example, given its penultimate
/// features `h`.
pub fn example_gradient(layer: &Linear, h: ArrayView1<f64>, label: usize) -> Result<Array1<f64>> {
    let tape = Tape::new();
    let vars = layer.leaves(&tape);
    let features = tape.constant(h.to_owned().insert_axis(Axis(0)));
    let loss = cross_entropy(&vars.forward(&features), &[label])?;
    let grads = tape.grad(&loss, &vars.params())?;
    Ok(flatten_vars(&grads))
}

/// One gradient row per example, `(n, p)`.
pub fn example_gradients(layer: &Linear, h: &Array2<f64>, labels: &[usize]) -> Result<Array2<f64>> {
    let mut out = Array2::zeros((h.nrows(), layer.num_params()));
    for (i, (row, &label)) in h.rows().into_iter().zip(labels).enumerate() {
        out.row_mut(i).assign(&example_gradient(layer, row, label)?);
    }
    Ok(out)
}

/// `H v` for the mean cross entropy of a batch of penultimate features.
pub fn batch_hvp(layer: &Linear, h: &Array2<f64>, labels: &[usize], v: &Array1<f64>) -> Result<Array1<f64>> {
    let tape = Tape::new();
    let vars = layer.leaves(&tape);
    let features = tape.constant(h.clone());
    let loss = cross_entropy(&vars.forward(&features), labels)?;
    hessian_vector_product(&tape, &loss, &vars.params(), v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn layer() -> Linear {
        Linear {
            weight: array![[0.5, -0.2], [0.1, 0.3], [-0.4, 0.2]],
            bias: array![0.0, 0.1, -0.1],
        }
    }

    #[test]
    fn test_example_gradient_matches_closed_form() {
        let layer = layer();
        let h = array![1.0, 2.0];
        let g = example_gradient(&layer, h.view(), 1).unwrap();

        let logits = layer.weight.dot(&h) + &layer.bias;
        let max = logits.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let e = logits.mapv(|v| (v - max).exp());
        let p = &e / e.sum();
        for k in 0..3 {
            let dk = p[k] - if k == 1 { 1.0 } else { 0.0 };
            for j in 0..2 {
                assert_abs_diff_eq!(g[k * 2 + j], dk * h[j], epsilon = 1e-10);
            }
            assert_abs_diff_eq!(g[6 + k], dk, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_batch_hvp_is_symmetric() {
        let layer = layer();
        let h = array![[1.0, 0.5], [-0.3, 2.0]];
        let labels = [0, 2];
        let u = Array1::from_shape_fn(9, |i| (i as f64 * 0.37).sin());
        let v = Array1::from_shape_fn(9, |i| (i as f64 * 0.91).cos());
        let hv = batch_hvp(&layer, &h, &labels, &v).unwrap();
        let hu = batch_hvp(&layer, &h, &labels, &u).unwrap();
        assert_abs_diff_eq!(u.dot(&hv), v.dot(&hu), epsilon = 1e-10);
    }

    #[test]
    fn test_flatten_order_is_weight_then_bias() {
        let flat = flatten_linear(&layer());
        assert_eq!(flat.len(), 9);
        assert_eq!(flat[1], -0.2);
        assert_eq!(flat[6], 0.0);
        assert_eq!(flat[8], -0.1);
    }
}
