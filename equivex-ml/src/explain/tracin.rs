//! TracIn: training-trajectory influence through saved checkpoints.
//!
//! `score[i, j] = Σ_k ⟨∇θ L(test_i; θ_k), ∇θ L(train_j; θ_k)⟩` with θ the
//! last-layer parameters and θ_k the k-th checkpoint.

use std::path::Path;

use ndarray::{Array1, Array2, Array4};

use super::Explainer;
use super::gradients::{example_gradients, penultimate_batched};
use super::replay::CheckpointReplay;
use crate::cache::{CacheKind, GradientCache};
use crate::data::Dataset;
use crate::error::{Result, XaiError};
use crate::model::{Classifier, fingerprint_state};
use crate::persistence::Fingerprint;

/// Holds the model mutably for its whole lifetime: every query reloads the
/// checkpoints into it and restores the original parameters afterwards.
pub struct TracIn<'m, M: Classifier + ?Sized> {
    model: &'m mut M,
    replay: CheckpointReplay,
    train: Dataset,
    cache: GradientCache,
    batch_size: usize,
    precomputed: bool,
}

impl<'m, M: Classifier + ?Sized> TracIn<'m, M> {
    /// Train gradients are cached under `save_dir/tracin`.
    pub fn new(
        model: &'m mut M,
        train: Dataset,
        replay: CheckpointReplay,
        save_dir: &Path,
        batch_size: usize,
    ) -> Result<Self> {
        let mut fp = Fingerprint::new("tracin");
        fp.update_str(model.last_layer_name());
        fingerprint_state(&mut fp, &model.state_dict());
        replay.fingerprint(&mut fp)?;
        train.fingerprint(&mut fp);
        let cache = GradientCache::new(save_dir.join("tracin"), CacheKind::Grad, fp.finish());
        Ok(Self {
            model,
            replay,
            train,
            cache,
            batch_size,
            precomputed: false,
        })
    }

    pub fn cache(&self) -> &GradientCache {
        &self.cache
    }

    /// Per-checkpoint gradients `(K, n, p)`, one matrix per checkpoint.
    fn trajectory_gradients(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Vec<Array2<f64>>> {
        let labels = y.to_vec();
        let mut per_checkpoint = Vec::with_capacity(self.replay.len());
        let result = (|| -> Result<()> {
            for k in 0..self.replay.len() {
                self.replay.load(&mut *self.model, k)?;
                let h = penultimate_batched(&*self.model, x, self.batch_size)?;
                per_checkpoint.push(example_gradients(self.model.last_layer(), &h, &labels)?);
            }
            Ok(())
        })();
        self.replay.restore(&mut *self.model)?;
        result.map(|()| per_checkpoint)
    }

    /// Compute and cache the train gradients unless a fresh cache exists.
    pub fn precompute(&mut self) -> Result<()> {
        let n = self.train.len();
        if self.cache.prepare(n)? {
            self.precomputed = true;
            return Ok(());
        }
        tracing::info!(train = n, checkpoints = self.replay.len(), "precomputing TracIn train gradients");
        let x = self.train.x.clone();
        let y = self.train.y.clone();
        let per_checkpoint = self.trajectory_gradients(&x, &y)?;
        let p = self.model.last_layer().num_params();
        for j in 0..n {
            let mut rows = Array2::<f64>::zeros((per_checkpoint.len(), p));
            for (k, grads) in per_checkpoint.iter().enumerate() {
                rows.row_mut(k).assign(&grads.row(j));
            }
            self.cache.store(j, &rows)?;
        }
        self.cache.finalize(n)?;
        self.precomputed = true;
        Ok(())
    }
}

impl<M: Classifier + ?Sized> Explainer for TracIn<'_, M> {
    fn name(&self) -> &str {
        "TracIn"
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array2<f64>> {
        if x.dim().0 != y.len() {
            return Err(XaiError::shape(format!(
                "{} test inputs but {} labels",
                x.dim().0,
                y.len()
            )));
        }
        if !self.precomputed {
            self.precompute()?;
        }
        let test = self.trajectory_gradients(x, y)?;
        let n_test = y.len();
        let mut scores = Array2::<f64>::zeros((n_test, self.train.len()));
        for j in 0..self.train.len() {
            let train_rows = self.cache.load(j)?;
            if train_rows.nrows() != test.len() {
                return Err(XaiError::cache(format!(
                    "cached gradient {j} covers {} checkpoints, expected {}",
                    train_rows.nrows(),
                    test.len()
                )));
            }
            for i in 0..n_test {
                scores[[i, j]] = test
                    .iter()
                    .zip(train_rows.rows())
                    .map(|(g, t)| g.row(i).dot(&t))
                    .sum();
            }
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::shifted_patterns;
    use crate::explain::gradients::example_gradient;
    use crate::model::{LoadMode, Sequential, write_checkpoint};
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;

    fn checkpoints(dir: &Path, seeds: &[u64]) -> Vec<PathBuf> {
        seeds
            .iter()
            .map(|&seed| {
                let path = dir.join(format!("ckpt_{seed}.ckpt"));
                write_checkpoint(&path, &Sequential::mlp(8, &[4], 2, seed).state_dict(), None).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_single_checkpoint_is_gradient_dot_product() {
        let dir = tempfile::tempdir().unwrap();
        let data = shifted_patterns(4, 2, 8, 0.1, 0).unwrap();
        let paths = checkpoints(dir.path(), &[42]);
        let mut model = Sequential::mlp(8, &[4], 2, 0);
        let reference = Sequential::mlp(8, &[4], 2, 42);

        let replay = CheckpointReplay::new(paths, LoadMode::Strict).unwrap();
        let mut tracin = TracIn::new(&mut model, data.clone(), replay, dir.path(), 2).unwrap();
        let scores = tracin.attribute(&data.x, &data.y).unwrap();

        let h = reference.penultimate(&data.x).unwrap();
        for i in 0..4 {
            let gi = example_gradient(reference.last_layer(), h.row(i), data.y[i]).unwrap();
            for j in 0..4 {
                let gj = example_gradient(reference.last_layer(), h.row(j), data.y[j]).unwrap();
                assert_abs_diff_eq!(scores[[i, j]], gi.dot(&gj), epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_scores_sum_over_checkpoints_and_model_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let data = shifted_patterns(3, 2, 8, 0.0, 5).unwrap();
        let mut model = Sequential::mlp(8, &[4], 2, 0);
        let before = model.state_dict();

        let mut single = Vec::new();
        for seed in [1, 2] {
            let sub = tempfile::tempdir().unwrap();
            let replay = CheckpointReplay::new(checkpoints(sub.path(), &[seed]), LoadMode::Strict).unwrap();
            let mut tracin = TracIn::new(&mut model, data.clone(), replay, sub.path(), 8).unwrap();
            single.push(tracin.attribute(&data.x, &data.y).unwrap());
        }
        let replay = CheckpointReplay::new(checkpoints(dir.path(), &[1, 2]), LoadMode::Strict).unwrap();
        let mut tracin = TracIn::new(&mut model, data.clone(), replay, dir.path(), 8).unwrap();
        let both = tracin.attribute(&data.x, &data.y).unwrap();
        drop(tracin);

        for (a, b) in both.iter().zip((&single[0] + &single[1]).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        assert_eq!(model.state_dict(), before);
    }

    #[test]
    fn test_second_engine_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let data = shifted_patterns(3, 2, 8, 0.0, 5).unwrap();
        let paths = checkpoints(dir.path(), &[3]);
        let mut model = Sequential::mlp(8, &[4], 2, 0);
        let first = {
            let replay = CheckpointReplay::new(paths.clone(), LoadMode::Strict).unwrap();
            let mut tracin = TracIn::new(&mut model, data.clone(), replay, dir.path(), 8).unwrap();
            tracin.attribute(&data.x, &data.y).unwrap()
        };
        let replay = CheckpointReplay::new(paths, LoadMode::Strict).unwrap();
        let tracin = TracIn::new(&mut model, data.clone(), replay, dir.path(), 8).unwrap();
        assert_eq!(tracin.cache().status(3).unwrap(), crate::cache::CacheStatus::Fresh);
        drop(tracin);
        assert_eq!(first.dim(), (3, 3));
    }
}
