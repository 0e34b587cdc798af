//! Perturbation-based feature importance.
//!
//! Every explainer scores an input entry by how much the logit of the
//! example's label drops when the entry is perturbed.

use ndarray::{Array1, Array4, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::FeatureExplainer;
use crate::error::{Result, XaiError};
use crate::model::Classifier;

fn target_logits<M: Classifier + ?Sized>(model: &M, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array1<f64>> {
    let logits = model.forward(x)?;
    if logits.nrows() != y.len() {
        return Err(XaiError::shape(format!(
            "{} inputs but {} labels",
            logits.nrows(),
            y.len()
        )));
    }
    y.iter()
        .enumerate()
        .map(|(i, &label)| {
            logits.get((i, label)).copied().ok_or_else(|| {
                XaiError::invalid_input(format!("label {label} out of range for {} classes", logits.ncols()))
            })
        })
        .collect()
}

/// Replace one entry at a time with a baseline value.
pub struct FeatureAblation<'m, M: Classifier + ?Sized> {
    model: &'m M,
    baseline: f64,
}

impl<'m, M: Classifier + ?Sized> FeatureAblation<'m, M> {
    pub fn new(model: &'m M) -> Self {
        Self { model, baseline: 0.0 }
    }

    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }
}

impl<M: Classifier + ?Sized> FeatureExplainer for FeatureAblation<'_, M> {
    fn name(&self) -> &str {
        "Feature Ablation"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>> {
        let reference = target_logits(self.model, x, y)?;
        let (n, c, h, w) = x.dim();
        let mut scores = Array4::<f64>::zeros(x.dim());
        for ch in 0..c {
            for i in 0..h {
                for j in 0..w {
                    let mut perturbed = x.clone();
                    for b in 0..n {
                        perturbed[[b, ch, i, j]] = self.baseline;
                    }
                    let out = target_logits(self.model, &perturbed, y)?;
                    for b in 0..n {
                        scores[[b, ch, i, j]] = reference[b] - out[b];
                    }
                }
            }
        }
        Ok(scores)
    }
}

/// Slide a baseline-filled window over the spatial axes; each entry gets the
/// mean drop over the windows covering it.
pub struct FeatureOcclusion<'m, M: Classifier + ?Sized> {
    model: &'m M,
    window: (usize, usize),
    stride: (usize, usize),
    baseline: f64,
}

impl<'m, M: Classifier + ?Sized> FeatureOcclusion<'m, M> {
    pub fn new(model: &'m M, window: (usize, usize), stride: (usize, usize)) -> Self {
        Self {
            model,
            window: (window.0.max(1), window.1.max(1)),
            stride: (stride.0.max(1), stride.1.max(1)),
            baseline: 0.0,
        }
    }
}

fn window_starts(extent: usize, window: usize, stride: usize) -> Vec<usize> {
    if window >= extent {
        return vec![0];
    }
    let mut starts: Vec<usize> = (0..=extent - window).step_by(stride).collect();
    if starts.last() != Some(&(extent - window)) {
        starts.push(extent - window);
    }
    starts
}

impl<M: Classifier + ?Sized> FeatureExplainer for FeatureOcclusion<'_, M> {
    fn name(&self) -> &str {
        "Feature Occlusion"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>> {
        let reference = target_logits(self.model, x, y)?;
        let (n, c, h, w) = x.dim();
        let (wh, ww) = (self.window.0.min(h), self.window.1.min(w));
        let mut sums = Array4::<f64>::zeros(x.dim());
        let mut counts = Array4::<f64>::zeros((1, 1, h, w));
        for top in window_starts(h, wh, self.stride.0) {
            for left in window_starts(w, ww, self.stride.1) {
                let mut perturbed = x.clone();
                perturbed
                    .slice_mut(s![.., .., top..top + wh, left..left + ww])
                    .fill(self.baseline);
                let out = target_logits(self.model, &perturbed, y)?;
                for i in top..top + wh {
                    for j in left..left + ww {
                        counts[[0, 0, i, j]] += 1.0;
                        for b in 0..n {
                            for ch in 0..c {
                                sums[[b, ch, i, j]] += reference[b] - out[b];
                            }
                        }
                    }
                }
            }
        }
        Ok(Array4::from_shape_fn(x.dim(), |(b, ch, i, j)| {
            let count = counts[[0, 0, i, j]];
            if count > 0.0 { sums[[b, ch, i, j]] / count } else { 0.0 }
        }))
    }
}

/// Shuffle one entry across the examples of the batch at a time.
pub struct FeaturePermutation<'m, M: Classifier + ?Sized> {
    model: &'m M,
    rng: StdRng,
}

impl<'m, M: Classifier + ?Sized> FeaturePermutation<'m, M> {
    pub fn new(model: &'m M, seed: u64) -> Self {
        Self {
            model,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<M: Classifier + ?Sized> FeatureExplainer for FeaturePermutation<'_, M> {
    fn name(&self) -> &str {
        "Feature Permutation"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>> {
        let reference = target_logits(self.model, x, y)?;
        let (n, c, h, w) = x.dim();
        let mut scores = Array4::<f64>::zeros(x.dim());
        let mut order: Vec<usize> = (0..n).collect();
        for ch in 0..c {
            for i in 0..h {
                for j in 0..w {
                    order.shuffle(&mut self.rng);
                    let mut perturbed = x.clone();
                    for (b, &src) in order.iter().enumerate() {
                        perturbed[[b, ch, i, j]] = x[[src, ch, i, j]];
                    }
                    let out = target_logits(self.model, &perturbed, y)?;
                    scores
                        .slice_mut(s![.., ch, i, j])
                        .assign(&(&reference - &out));
                }
            }
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Layer, Linear, Sequential};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Logit of class 0 is `2·x₀ − x₁`, class 1 is 0.
    fn linear_model() -> Sequential {
        Sequential::new(vec![
            ("flatten".into(), Layer::Flatten),
            (
                "out".into(),
                Layer::Linear(Linear {
                    weight: array![[2.0, -1.0], [0.0, 0.0]],
                    bias: array![0.0, 0.0],
                }),
            ),
        ])
        .unwrap()
    }

    fn input() -> (Array4<f64>, Array1<usize>) {
        (
            Array4::from_shape_vec((1, 1, 1, 2), vec![1.0, 3.0]).unwrap(),
            array![0],
        )
    }

    #[test]
    fn test_ablation_recovers_linear_contributions() {
        let model = linear_model();
        let (x, y) = input();
        let scores = FeatureAblation::new(&model).attribute(&x, &y).unwrap();
        assert_abs_diff_eq!(scores[[0, 0, 0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scores[[0, 0, 0, 1]], -3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_occlusion_with_unit_window_equals_ablation() {
        let model = linear_model();
        let (x, y) = input();
        let ablation = FeatureAblation::new(&model).attribute(&x, &y).unwrap();
        let occlusion = FeatureOcclusion::new(&model, (1, 1), (1, 1)).attribute(&x, &y).unwrap();
        assert_eq!(ablation, occlusion);
    }

    #[test]
    fn test_occlusion_windows_cover_edges() {
        assert_eq!(window_starts(5, 2, 2), vec![0, 2, 3]);
        assert_eq!(window_starts(3, 5, 1), vec![0]);
    }

    #[test]
    fn test_permutation_of_single_example_is_zero() {
        let model = linear_model();
        let (x, y) = input();
        let scores = FeaturePermutation::new(&model, 0).attribute(&x, &y).unwrap();
        assert!(scores.iter().all(|&s| s == 0.0));
    }
}
