//! Gradient-based feature importance.
//!
//! Both explainers integrate input gradients of the label logit along the
//! straight path from a baseline to the input, then scale by the input's
//! distance from the baseline.

use ndarray::{Array1, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::FeatureExplainer;
use crate::error::{Result, XaiError};
use crate::model::Classifier;

fn labels(y: &Array1<usize>, n: usize) -> Result<Vec<usize>> {
    if y.len() != n {
        return Err(XaiError::shape(format!("{n} inputs but {} labels", y.len())));
    }
    Ok(y.to_vec())
}

/// Integrated Gradients with a constant baseline, midpoint rule over
/// `steps` points of the path.
pub struct IntegratedGradients<'m, M: Classifier + ?Sized> {
    model: &'m M,
    baseline: f64,
    steps: usize,
}

impl<'m, M: Classifier + ?Sized> IntegratedGradients<'m, M> {
    pub fn new(model: &'m M) -> Self {
        Self {
            model,
            baseline: 0.0,
            steps: 50,
        }
    }

    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }
}

impl<M: Classifier + ?Sized> FeatureExplainer for IntegratedGradients<'_, M> {
    fn name(&self) -> &str {
        "Integrated Gradients"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>> {
        if self.steps == 0 {
            return Err(XaiError::invalid_input("integrated gradients needs at least one step"));
        }
        let targets = labels(y, x.dim().0)?;
        let delta = x.mapv(|v| v - self.baseline);
        let mut total = Array4::<f64>::zeros(x.dim());
        for k in 0..self.steps {
            let alpha = (k as f64 + 0.5) / self.steps as f64;
            let point = delta.mapv(|d| self.baseline + alpha * d);
            total += &self.model.input_gradients(&point, &targets)?;
        }
        Ok(total * &delta / self.steps as f64)
    }
}

/// Gradient SHAP: expected gradients over random baselines and random points
/// on the path, with optional uniform input noise.
pub struct GradientShap<'m, M: Classifier + ?Sized> {
    model: &'m M,
    /// `(k, c, h, w)` baselines drawn uniformly per sample.
    baselines: Option<Array4<f64>>,
    samples: usize,
    noise: f64,
    rng: StdRng,
}

impl<'m, M: Classifier + ?Sized> GradientShap<'m, M> {
    /// Zero baseline, five samples per example.
    pub fn new(model: &'m M, seed: u64) -> Self {
        Self {
            model,
            baselines: None,
            samples: 5,
            noise: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_baselines(mut self, baselines: Array4<f64>) -> Self {
        self.baselines = Some(baselines);
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    /// Half-width of the uniform noise added to the input before each draw.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    fn draw_baseline(&mut self, x: &Array4<f64>) -> Result<Array4<f64>> {
        let (n, c, h, w) = x.dim();
        let Some(pool) = &self.baselines else {
            return Ok(Array4::zeros(x.dim()));
        };
        let (k, pc, ph, pw) = pool.dim();
        if k == 0 || (pc, ph, pw) != (c, h, w) {
            return Err(XaiError::shape(format!(
                "baselines {:?} do not fit inputs {:?}",
                pool.dim(),
                x.dim()
            )));
        }
        let mut out = Array4::zeros(x.dim());
        for b in 0..n {
            let pick = self.rng.gen_range(0..k);
            out.index_axis_mut(Axis(0), b).assign(&pool.index_axis(Axis(0), pick));
        }
        Ok(out)
    }
}

impl<M: Classifier + ?Sized> FeatureExplainer for GradientShap<'_, M> {
    fn name(&self) -> &str {
        "Gradient Shap"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>> {
        if self.samples == 0 {
            return Err(XaiError::invalid_input("gradient shap needs at least one sample"));
        }
        let targets = labels(y, x.dim().0)?;
        let n = x.dim().0;
        let mut total = Array4::<f64>::zeros(x.dim());
        for _ in 0..self.samples {
            let baseline = self.draw_baseline(x)?;
            let noisy = if self.noise > 0.0 {
                let noise = self.noise;
                let rng = &mut self.rng;
                x.mapv(|v| v + rng.gen_range(-noise..=noise))
            } else {
                x.clone()
            };
            let alphas: Vec<f64> = (0..n).map(|_| self.rng.r#gen::<f64>()).collect();
            let mut point = baseline.clone();
            let mut delta = noisy - &baseline;
            for (b, &alpha) in alphas.iter().enumerate() {
                let mut row = point.index_axis_mut(Axis(0), b);
                row.scaled_add(alpha, &delta.index_axis(Axis(0), b));
            }
            let grads = self.model.input_gradients(&point, &targets)?;
            delta *= &grads;
            total += &delta;
        }
        Ok(total / self.samples as f64)
    }
}
