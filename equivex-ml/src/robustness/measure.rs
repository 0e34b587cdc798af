//! Invariance and equivariance of models and explanations under a group.
//!
//! Every measure returns one score per example of the dataset, the mean over
//! the group elements of a [`Similarity`] between the reference output and
//! the output on the transformed input.

use ndarray::{Array1, Axis, concatenate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::Similarity;
use crate::data::Dataset;
use crate::error::{Result, XaiError};
use crate::explain::{Explainer, FeatureExplainer};
use crate::model::Classifier;
use crate::symmetry::{Shape, SymmetryGroup};
use crate::tensor::flatten_batch;

/// Which group elements a measure averages over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum GroupSampling {
    /// Every element of the group.
    #[default]
    Exhaustive,
    /// `n` distinct elements drawn with a seeded generator.
    Sampled { n: usize, seed: u64 },
}

impl GroupSampling {
    pub fn elements<G: SymmetryGroup + ?Sized>(&self, group: &G, shape: Shape) -> Result<Vec<G::Element>> {
        let elements = match *self {
            GroupSampling::Exhaustive => group.elements(shape)?,
            GroupSampling::Sampled { n, seed } => group.sample(shape, n, &mut StdRng::seed_from_u64(seed))?,
        };
        if elements.is_empty() {
            return Err(XaiError::symmetry(format!(
                "no elements of {} selected for measurement",
                group.name()
            )));
        }
        Ok(elements)
    }
}

fn join(parts: Vec<Array1<f64>>) -> Result<Array1<f64>> {
    if parts.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| XaiError::shape(e.to_string()))
}

/// Mean of the per-example scores produced for each element.
fn average<T, F>(elements: &[T], examples: usize, mut score: F) -> Result<Array1<f64>>
where
    F: FnMut(&T) -> Result<Array1<f64>>,
{
    let mut total = Array1::<f64>::zeros(examples);
    for element in elements {
        total += &score(element)?;
    }
    Ok(total / elements.len() as f64)
}

fn log_summary(what: &str, group: &str, scores: &Array1<f64>) {
    tracing::info!(
        measure = what,
        group,
        examples = scores.len(),
        mean = scores.mean().unwrap_or(f64::NAN),
        "measurement finished"
    );
}

/// `mean_g s(f(x), f(gx))` over the model logits.
pub fn model_invariance<M, G>(
    model: &M,
    group: &G,
    data: &Dataset,
    batch_size: usize,
    sampling: GroupSampling,
    similarity: Similarity,
) -> Result<Array1<f64>>
where
    M: Classifier + ?Sized,
    G: SymmetryGroup + ?Sized,
{
    let elements = sampling.elements(group, data.shape())?;
    let mut parts = Vec::new();
    for batch in data.batches(batch_size) {
        let base = model.forward(&batch.x)?;
        parts.push(average(&elements, batch.len(), |element| {
            let moved = model.forward(&group.apply(&batch.x, element)?)?;
            similarity.compare(&base, &moved)
        })?);
    }
    let scores = join(parts)?;
    log_summary("model_invariance", group.name(), &scores);
    Ok(scores)
}

/// `mean_g s(e(gx), g·e(x))` for explanations living in input space.
///
/// `g·e(x)` moves the map the way `g` moves `x`, which matters for groups
/// that act depending on the input content.
pub fn explanation_equivariance<E, G>(
    explainer: &mut E,
    group: &G,
    data: &Dataset,
    batch_size: usize,
    sampling: GroupSampling,
    similarity: Similarity,
) -> Result<Array1<f64>>
where
    E: FeatureExplainer + ?Sized,
    G: SymmetryGroup + ?Sized,
{
    let elements = sampling.elements(group, data.shape())?;
    let mut parts = Vec::new();
    for batch in data.batches(batch_size) {
        let base = explainer.attribute(&batch.x, &batch.y)?;
        parts.push(average(&elements, batch.len(), |element| {
            let moved = explainer.attribute(&group.apply(&batch.x, element)?, &batch.y)?;
            let expected = group.apply_like(&batch.x, &base, element)?;
            similarity.compare(&flatten_batch(&moved), &flatten_batch(&expected))
        })?);
    }
    let scores = join(parts)?;
    tracing::debug!(explainer = explainer.name(), "explanation equivariance computed");
    log_summary("explanation_equivariance", group.name(), &scores);
    Ok(scores)
}

/// `mean_g s(e(gx), e(x))` for example-based and concept explanations.
pub fn explanation_invariance<E, G>(
    explainer: &mut E,
    group: &G,
    data: &Dataset,
    batch_size: usize,
    sampling: GroupSampling,
    similarity: Similarity,
) -> Result<Array1<f64>>
where
    E: Explainer + ?Sized,
    G: SymmetryGroup + ?Sized,
{
    let elements = sampling.elements(group, data.shape())?;
    let mut parts = Vec::new();
    for batch in data.batches(batch_size) {
        let base = explainer.attribute(&batch.x, &batch.y)?;
        parts.push(average(&elements, batch.len(), |element| {
            let moved = explainer.attribute(&group.apply(&batch.x, element)?, &batch.y)?;
            similarity.compare(&moved, &base)
        })?);
    }
    let scores = join(parts)?;
    tracing::debug!(explainer = explainer.name(), "explanation invariance computed");
    log_summary("explanation_invariance", group.name(), &scores);
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{shifted_patterns, shifted_squares};
    use crate::explain::FeatureAblation;
    use crate::model::Sequential;
    use crate::symmetry::{AnchoredTranslation2D, Dihedral, Translation1D, Translation2D};
    use crate::tensor::roll_spatial;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array4, array};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_invariant_cnn_is_translation_invariant() {
        let data = shifted_squares(6, 2, 6, 4).unwrap();
        let model = Sequential::invariant_cnn(1, 3, 2, 1);
        let scores = model_invariance(
            &model,
            &Translation2D::new(None),
            &data,
            4,
            GroupSampling::Exhaustive,
            Similarity::Cosine,
        )
        .unwrap();
        assert_eq!(scores.len(), 6);
        for s in scores.iter() {
            assert_abs_diff_eq!(*s, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_dihedral_cnn_is_d4_invariant() {
        let data = shifted_squares(4, 2, 6, 8).unwrap();
        let model = Sequential::dihedral_cnn(1, 3, 2, 5);
        let scores = model_invariance(
            &model,
            &Dihedral,
            &data,
            4,
            GroupSampling::Exhaustive,
            Similarity::Cosine,
        )
        .unwrap();
        for s in scores.iter() {
            assert_abs_diff_eq!(*s, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_sampled_measure_is_reproducible() {
        let data = shifted_patterns(5, 2, 12, 0.1, 3).unwrap();
        let model = Sequential::mlp(12, &[6], 2, 3);
        let group = Translation1D::new(None);
        let sampling = GroupSampling::Sampled { n: 4, seed: 9 };
        let a = model_invariance(&model, &group, &data, 2, sampling, Similarity::Cosine).unwrap();
        let b = model_invariance(&model, &group, &data, 2, sampling, Similarity::Cosine).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|s| (-1.0..=1.0 + 1e-12).contains(s)));
    }

    #[test]
    fn test_zero_elements_is_an_error() {
        let data = shifted_patterns(2, 2, 8, 0.0, 0).unwrap();
        let model = Sequential::mlp(8, &[3], 2, 0);
        let err = model_invariance(
            &model,
            &Translation1D::new(None),
            &data,
            2,
            GroupSampling::Sampled { n: 0, seed: 0 },
            Similarity::Cosine,
        );
        assert!(err.is_err());
    }

    /// Ablation of a model whose logits ignore the input is zero everywhere,
    /// so both sides of the equivariance comparison are zero maps.
    #[test]
    fn test_constant_model_has_equivariant_ablation() {
        let data = shifted_patterns(3, 2, 6, 0.0, 2).unwrap();
        let mut model = Sequential::mlp(6, &[], 2, 0);
        let mut state = model.state_dict();
        for (name, tensor) in state.iter_mut() {
            if name.ends_with("weight") {
                tensor.data.iter_mut().for_each(|v| *v = 0.0);
            }
        }
        model.load_state_dict(&state, crate::model::LoadMode::Strict).unwrap();
        let mut explainer = FeatureAblation::new(&model);
        let scores = explanation_equivariance(
            &mut explainer,
            &Translation1D::new(None),
            &data,
            3,
            GroupSampling::Exhaustive,
            Similarity::Cosine,
        )
        .unwrap();
        assert!(scores.iter().all(|&s| s == 1.0));
    }

    /// Rolls its input by a fixed offset, so it commutes with every
    /// translation.
    struct Rolled;

    impl FeatureExplainer for Rolled {
        fn name(&self) -> &str {
            "rolled"
        }

        fn attribute(&mut self, x: &Array4<f64>, _y: &Array1<usize>) -> crate::error::Result<Array4<f64>> {
            Ok(roll_spatial(x, 0, 2))
        }
    }

    #[test]
    fn test_equivariant_explainer_scores_one_under_anchored_translation() {
        let data = shifted_squares(4, 2, 8, 6).unwrap();
        for scores in [
            explanation_equivariance(
                &mut Rolled,
                &Translation2D::new(Some(1)),
                &data,
                2,
                GroupSampling::Exhaustive,
                Similarity::Cosine,
            )
            .unwrap(),
            explanation_equivariance(
                &mut Rolled,
                &AnchoredTranslation2D::new(1),
                &data,
                2,
                GroupSampling::Exhaustive,
                Similarity::Cosine,
            )
            .unwrap(),
        ] {
            for s in scores.iter() {
                assert_abs_diff_eq!(*s, 1.0, epsilon = 1e-9);
            }
        }
    }

    struct Summary;

    impl Explainer for Summary {
        fn name(&self) -> &str {
            "summary"
        }

        fn attribute(&mut self, x: &Array4<f64>, _y: &Array1<usize>) -> crate::error::Result<Array2<f64>> {
            let rows = flatten_batch(x);
            Ok(Array2::from_shape_fn((rows.nrows(), 1), |(i, _)| rows.row(i).sum()))
        }
    }

    #[test]
    fn test_permutation_invariant_explainer_scores_one() {
        let data = Dataset::new(
            Array4::from_shape_vec((2, 1, 1, 3), vec![1.0, 2.0, 3.0, -1.0, 0.5, 4.0]).unwrap(),
            array![0, 1],
        )
        .unwrap();
        let scores = explanation_invariance(
            &mut Summary,
            &Translation1D::new(None),
            &data,
            1,
            GroupSampling::Exhaustive,
            Similarity::Cosine,
        )
        .unwrap();
        assert_eq!(scores.to_vec(), vec![1.0, 1.0]);
    }
}
