//! Robustness of predictions and explanations under symmetries.

pub mod invariant;
pub mod measure;
pub mod sensitivity;
pub mod similarity;

pub use invariant::{Aggregation, InvariantExplainer};
pub use measure::{GroupSampling, explanation_equivariance, explanation_invariance, model_invariance};
pub use sensitivity::{DEFAULT_RADIUS, DEFAULT_SAMPLES, explanation_sensitivity, pearson_correlation};
pub use similarity::Similarity;
