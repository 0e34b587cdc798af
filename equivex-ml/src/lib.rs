//! # equivex-ml: Explanation Robustness under Input Symmetries
//!
//! This crate measures how consistent model predictions and explanations are
//! when inputs are transformed by a symmetry group (translations, rotations,
//! reflections).
//!
//! ## Layers
//!
//! 1. **Symmetries**: groups that enumerate, sample and apply transformations
//! 2. **Models**: the [`Classifier`] capability interface, preset architectures,
//!    state dicts and checkpoint replay
//! 3. **Explainers**: feature, example and concept attribution, with second-order
//!    gradients on a small reverse-mode tape
//! 4. **Robustness**: invariance/equivariance measures, the invariant explainer
//!    wrapper and sensitivity

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod tensor;

// Symmetries and data
pub mod data;
pub mod symmetry;

// Models
pub mod autograd;
pub mod hooks;
pub mod model;

// Explainers
pub mod cache;
pub mod explain;

// Measurement and export
pub mod metrics;
pub mod robustness;

// Re-exports
pub use config::{ConfigOverrides, EquivexConfig, load_config};
pub use data::Dataset;
pub use error::{Result, XaiError};
pub use explain::{Explainer, FeatureExplainer};
pub use hooks::ActivationCapture;
pub use metrics::{MetricsTable, TableKind};
pub use model::{Architecture, Classifier, LoadMode, Sequential};
pub use robustness::{
    Aggregation, GroupSampling, InvariantExplainer, Similarity, explanation_equivariance, explanation_invariance,
    explanation_sensitivity, model_invariance,
};
pub use symmetry::SymmetryGroup;
