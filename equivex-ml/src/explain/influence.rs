//! Influence functions with a stochastic inverse-HVP estimate.
//!
//! For every training example the recursion
//!
//! ```text
//! ihvp ← ∇θL(train_j) + (1 − DAMP)·ihvp − H_batch·ihvp / SCALE
//! ```
//!
//! runs for `recursion_depth` steps, each on a fresh mini-batch drawn with
//! replacement from the training set. Example `j` samples from a generator
//! seeded with `seed ^ j`, so its estimate does not depend on the examples
//! processed before it. The score of train example `j` for test
//! example `i` is `⟨ihvp_j, ∇θL(test_i)⟩`.

use std::path::Path;

use ndarray::{Array1, Array2, Array4, Axis};

use super::Explainer;
use super::gradients::{batch_hvp, example_gradient, example_gradients, penultimate_batched};
use crate::cache::{CacheKind, GradientCache};
use crate::data::{Dataset, ReplacementSampler};
use crate::error::{Result, XaiError};
use crate::model::{Classifier, Linear, fingerprint_state};
use crate::persistence::Fingerprint;
use crate::tensor::select_labels;

pub const DAMP: f64 = 1e-3;
pub const SCALE: f64 = 1000.0;

/// Convergence information of the last precomputation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfluenceDiagnostics {
    /// Norm of the final recursion update, per training example.
    pub final_update_norms: Vec<f64>,
}

pub struct InfluenceFunctions<'m, M: Classifier + ?Sized> {
    model: &'m M,
    train: Dataset,
    cache: GradientCache,
    recursion_depth: usize,
    sample_size: usize,
    seed: u64,
    batch_size: usize,
    precomputed: bool,
    diagnostics: Option<InfluenceDiagnostics>,
}

impl<'m, M: Classifier + ?Sized> InfluenceFunctions<'m, M> {
    /// IHVPs are cached under `save_dir/influence_functions`.
    pub fn new(
        model: &'m M,
        train: Dataset,
        save_dir: &Path,
        recursion_depth: usize,
        sample_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if train.is_empty() {
            return Err(XaiError::invalid_input("influence functions need training examples"));
        }
        let mut fp = Fingerprint::new("influence");
        fingerprint_state(&mut fp, &model.state_dict());
        train.fingerprint(&mut fp);
        fp.update_u64(recursion_depth as u64)
            .update_u64(sample_size as u64)
            .update_u64(seed)
            .update_f64(DAMP)
            .update_f64(SCALE);
        let cache = GradientCache::new(save_dir.join("influence_functions"), CacheKind::Ihvp, fp.finish());
        Ok(Self {
            model,
            train,
            cache,
            recursion_depth,
            sample_size: sample_size.max(1),
            seed,
            batch_size: 256,
            precomputed: false,
            diagnostics: None,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Last precomputation's diagnostics; `None` when the cache was reused.
    pub fn diagnostics(&self) -> Option<&InfluenceDiagnostics> {
        self.diagnostics.as_ref()
    }

    pub fn cache(&self) -> &GradientCache {
        &self.cache
    }

    pub fn precompute(&mut self) -> Result<()> {
        let n = self.train.len();
        if self.cache.prepare(n)? {
            self.precomputed = true;
            return Ok(());
        }
        tracing::info!(train = n, depth = self.recursion_depth, "precomputing inverse Hessian-vector products");
        let layer = self.model.last_layer().clone();
        let h_train = penultimate_batched(self.model, &self.train.x, self.batch_size)?;
        let mut diagnostics = InfluenceDiagnostics::default();

        for j in 0..n {
            let (ihvp, update_norm) = self.recursion(&layer, &h_train, j)?;
            tracing::debug!(example = j, update_norm, "ihvp recursion finished");
            diagnostics.final_update_norms.push(update_norm);
            self.cache.store(j, &ihvp.insert_axis(Axis(0)))?;
        }
        self.cache.finalize(n)?;
        self.diagnostics = Some(diagnostics);
        self.precomputed = true;
        Ok(())
    }
}

impl<M: Classifier + ?Sized> InfluenceFunctions<'_, M> {
    /// Inverse Hessian-vector product of training example `j`, computed
    /// without the cache.
    pub fn inverse_hvp(&self, j: usize) -> Result<Array1<f64>> {
        if j >= self.train.len() {
            return Err(XaiError::invalid_input(format!(
                "training example {j} out of range for {} examples",
                self.train.len()
            )));
        }
        let h_train = penultimate_batched(self.model, &self.train.x, self.batch_size)?;
        Ok(self.recursion(self.model.last_layer(), &h_train, j)?.0)
    }

    /// LiSSA recursion for example `j` and the norm of its last update. Every
    /// example draws its Hessian batches from its own stream.
    fn recursion(&self, layer: &Linear, h_train: &Array2<f64>, j: usize) -> Result<(Array1<f64>, f64)> {
        let grad = example_gradient(layer, h_train.row(j), self.train.y[j])?;
        let mut sampler = ReplacementSampler::new(self.train.len(), self.seed ^ j as u64);
        let mut ihvp = grad.clone();
        let mut update_norm = 0.0;
        for _ in 0..self.recursion_depth {
            let picked = sampler.next_batch(self.sample_size)?;
            let h = h_train.select(Axis(0), &picked);
            let labels = select_labels(&self.train.y, &picked).to_vec();
            let hvp = batch_hvp(layer, &h, &labels, &ihvp)?;
            let next = &grad + &(&ihvp * (1.0 - DAMP)) - &(hvp / SCALE);
            update_norm = (&next - &ihvp).mapv(|v| v * v).sum().sqrt();
            ihvp = next;
        }
        Ok((ihvp, update_norm))
    }
}

impl<M: Classifier + ?Sized> Explainer for InfluenceFunctions<'_, M> {
    fn name(&self) -> &str {
        "Influence Functions"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array2<f64>> {
        if !self.precomputed {
            self.precompute()?;
        }
        let h = penultimate_batched(self.model, x, self.batch_size)?;
        let test_grads = example_gradients(self.model.last_layer(), &h, &y.to_vec())?;
        let mut scores = Array2::<f64>::zeros((y.len(), self.train.len()));
        for j in 0..self.train.len() {
            let ihvp = self.cache.load(j)?;
            if ihvp.ncols() != test_grads.ncols() {
                return Err(XaiError::cache(format!(
                    "cached ihvp {j} has {} entries, expected {}",
                    ihvp.ncols(),
                    test_grads.ncols()
                )));
            }
            scores.column_mut(j).assign(&test_grads.dot(&ihvp.row(0)));
        }
        Ok(scores)
    }
}
