//! Attribution engines.
//!
//! Example-based engines ([`RepresentationSimilarity`], [`SimplEx`],
//! [`TracIn`], [`InfluenceFunctions`]) score every training example for every
//! test example. Concept explainers score concept membership. Feature
//! explainers score input entries and return input-shaped maps.

pub mod concept;
pub mod feature;
pub mod gradients;
pub mod influence;
pub mod replay;
pub mod saliency;
pub mod similarity;
pub mod simplex;
pub mod tracin;

pub use concept::{ConceptClassifier, ConceptExplainer};
pub use feature::{FeatureAblation, FeatureOcclusion, FeaturePermutation};
pub use influence::{InfluenceDiagnostics, InfluenceFunctions};
pub use replay::CheckpointReplay;
pub use saliency::{GradientShap, IntegratedGradients};
pub use similarity::RepresentationSimilarity;
pub use simplex::{SimplEx, SimplexDiagnostics};
pub use tracin::TracIn;

use ndarray::{Array1, Array2, Array4};

use crate::error::Result;

/// An explainer producing one row of scores per test example.
pub trait Explainer {
    fn name(&self) -> &str;

    /// Scores `(n_test, n_units)` where units are training examples or
    /// concepts.
    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array2<f64>>;
}

/// An explainer scoring every input entry.
pub trait FeatureExplainer {
    fn name(&self) -> &str;

    /// Scores with the shape of `x`.
    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>>;
}

impl<E: Explainer + ?Sized> Explainer for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array2<f64>> {
        (**self).attribute(x, y)
    }
}

impl<E: FeatureExplainer + ?Sized> FeatureExplainer for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array4<f64>> {
        (**self).attribute(x, y)
    }
}
