//! Explanation sensitivity to small input perturbations, and the correlation
//! used to compare it with equivariance.

use ndarray::{Array1, Array4, Axis, concatenate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::similarity::pearson;
use crate::data::Dataset;
use crate::error::{Result, XaiError};
use crate::explain::FeatureExplainer;
use crate::tensor::flatten_batch;

pub const DEFAULT_RADIUS: f64 = 0.02;
pub const DEFAULT_SAMPLES: usize = 10;

/// Per example, the largest relative change `‖e(x + δ) − e(x)‖ / ‖e(x)‖` over
/// `n_samples` perturbations `δ` drawn uniformly from `[-radius, radius]`.
/// A zero explanation is compared in absolute terms.
pub fn explanation_sensitivity<E: FeatureExplainer + ?Sized>(
    explainer: &mut E,
    data: &Dataset,
    batch_size: usize,
    radius: f64,
    n_samples: usize,
    seed: u64,
) -> Result<Array1<f64>> {
    if !radius.is_finite() || radius < 0.0 {
        return Err(XaiError::invalid_input(format!("perturbation radius {radius} is not a non-negative number")));
    }
    if n_samples == 0 {
        return Err(XaiError::invalid_input("sensitivity needs at least one perturbation"));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut parts = Vec::new();
    for batch in data.batches(batch_size) {
        let base = flatten_batch(&explainer.attribute(&batch.x, &batch.y)?);
        let norms = base.map_axis(Axis(1), |row| {
            let norm = row.dot(&row).sqrt();
            if norm == 0.0 { 1.0 } else { norm }
        });
        let mut worst = Array1::<f64>::zeros(batch.len());
        for _ in 0..n_samples {
            let noise = Array4::from_shape_fn(batch.x.dim(), |_| rng.gen_range(-radius..=radius));
            let moved = flatten_batch(&explainer.attribute(&(&batch.x + &noise), &batch.y)?);
            if moved.dim() != base.dim() {
                return Err(XaiError::shape(format!(
                    "explanation changed shape from {:?} to {:?} under perturbation",
                    base.dim(),
                    moved.dim()
                )));
            }
            for (i, (a, b)) in moved.rows().into_iter().zip(base.rows()).enumerate() {
                let diff = &a - &b;
                worst[i] = worst[i].max(diff.dot(&diff).sqrt() / norms[i]);
            }
        }
        parts.push(worst);
    }
    if parts.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    let scores = concatenate(Axis(0), &views).map_err(|e| XaiError::shape(e.to_string()))?;
    tracing::info!(
        explainer = explainer.name(),
        radius,
        samples = n_samples,
        mean = scores.mean().unwrap_or(f64::NAN),
        "explanation sensitivity computed"
    );
    Ok(scores)
}

/// Pearson correlation of two metric vectors. Constant vectors carry no
/// linear signal and correlate at 0.
pub fn pearson_correlation(a: &Array1<f64>, b: &Array1<f64>) -> Result<f64> {
    if a.len() != b.len() {
        return Err(XaiError::shape(format!(
            "cannot correlate {} with {} values",
            a.len(),
            b.len()
        )));
    }
    if a.len() < 2 {
        return Err(XaiError::invalid_input("correlation needs at least two values"));
    }
    Ok(pearson(a.view(), b.view()).unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::shifted_patterns;
    use crate::explain::FeatureAblation;
    use crate::model::{Layer, Linear, Sequential};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    /// Ablation scores of a linear model are `w ⊙ x`, so they move with the
    /// input.
    fn linear_model(width: usize) -> Sequential {
        let weight = Array2::from_shape_fn((2, width), |(k, j)| {
            let w = 1.0 + j as f64;
            if k == 0 { w } else { -w }
        });
        Sequential::new(vec![
            ("flatten".into(), Layer::Flatten),
            (
                "out".into(),
                Layer::Linear(Linear {
                    weight,
                    bias: Array1::zeros(2),
                }),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_zero_radius_is_insensitive() {
        let data = shifted_patterns(4, 2, 6, 0.1, 0).unwrap();
        let model = linear_model(6);
        let scores = explanation_sensitivity(&mut FeatureAblation::new(&model), &data, 2, 0.0, 3, 1).unwrap();
        assert_eq!(scores.len(), 4);
        assert!(scores.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_sensitivity_grows_with_radius_and_is_seeded() {
        let data = shifted_patterns(4, 2, 6, 0.1, 0).unwrap();
        let model = linear_model(6);
        let small = explanation_sensitivity(&mut FeatureAblation::new(&model), &data, 4, 0.01, 5, 3).unwrap();
        let large = explanation_sensitivity(&mut FeatureAblation::new(&model), &data, 4, 0.5, 5, 3).unwrap();
        let again = explanation_sensitivity(&mut FeatureAblation::new(&model), &data, 4, 0.01, 5, 3).unwrap();
        assert_eq!(small, again);
        assert!(small.iter().all(|&s| s > 0.0));
        assert!(large.mean().unwrap() > small.mean().unwrap());
    }

    #[test]
    fn test_pearson_correlation() {
        let r = pearson_correlation(&array![1.0, 2.0, 3.0], &array![3.0, 2.0, 1.0]).unwrap();
        assert_abs_diff_eq!(r, -1.0, epsilon = 1e-12);
        assert_eq!(pearson_correlation(&array![1.0, 1.0], &array![0.0, 2.0]).unwrap(), 0.0);
        assert!(pearson_correlation(&array![1.0], &array![1.0]).is_err());
        assert!(pearson_correlation(&array![1.0, 2.0], &array![1.0]).is_err());
    }
}
