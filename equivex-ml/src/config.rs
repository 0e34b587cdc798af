//! Configuration for equivex experiments.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.
//! Configuration is loaded from `~/.config/equivex/config.toml` and/or
//! `.equivex/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, XaiError};
use crate::model::{Architecture, LoadMode};
use crate::robustness::{GroupSampling, Similarity};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquivexConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub symmetry: SymmetryConfig,
    pub feature: FeatureConfig,
    pub simplex: SimplexConfig,
    pub influence: InfluenceConfig,
    pub tracin: TracinConfig,
    pub concepts: ConceptConfig,
    pub invariance: InvarianceConfig,
    pub sensitivity: SensitivityConfig,
    pub output: OutputConfig,
}

/// Where examples come from. Without CSV paths a synthetic shifted-pattern
/// dataset is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_csv: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_csv: Option<PathBuf>,
    /// Collapse every non-zero label to 1 when reading CSV signals.
    #[serde(default = "default_true")]
    pub binarize_labels: bool,
    #[serde(default = "default_n_train")]
    pub n_train: usize,
    #[serde(default = "default_n_test")]
    pub n_test: usize,
    #[serde(default = "default_signal_length")]
    pub signal_length: usize,
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_csv: None,
            test_csv: None,
            binarize_labels: true,
            n_train: default_n_train(),
            n_test: default_n_test(),
            signal_length: default_signal_length(),
            classes: default_classes(),
            noise: default_noise(),
            batch_size: default_batch_size(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Every architecture gets its own rows in the result tables.
    #[serde(default = "default_architectures")]
    pub architectures: Vec<Architecture>,
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Directory holding `<architecture>.ckpt` parameter files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default = "default_load_mode")]
    pub load_mode: LoadMode,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: default_architectures(),
            hidden: default_hidden(),
            seed: default_seed(),
            checkpoint_dir: None,
            load_mode: default_load_mode(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    #[default]
    Translation1d,
    Translation2d,
    Dihedral,
    AnchoredTranslation2d,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymmetryConfig {
    #[serde(default)]
    pub group: GroupKind,
    /// Number of 1-D shifts; all of them when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_steps: Option<usize>,
    /// Largest 2-D displacement; the full torus when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_displacement: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_occlusion_window")]
    pub occlusion_window: usize,
    #[serde(default = "default_one")]
    pub occlusion_stride: usize,
    #[serde(default)]
    pub baseline: f64,
    /// Path points of Integrated Gradients.
    #[serde(default = "default_ig_steps")]
    pub ig_steps: usize,
    /// Random path points per example for Gradient SHAP.
    #[serde(default = "default_shap_samples")]
    pub shap_samples: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            occlusion_window: default_occlusion_window(),
            occlusion_stride: 1,
            baseline: 0.0,
            ig_steps: default_ig_steps(),
            shap_samples: default_shap_samples(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplexConfig {
    #[serde(default = "default_simplex_epochs")]
    pub epochs: usize,
    #[serde(default = "default_simplex_lr")]
    pub learning_rate: f64,
}

impl Default for SimplexConfig {
    fn default() -> Self {
        Self {
            epochs: default_simplex_epochs(),
            learning_rate: default_simplex_lr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluenceConfig {
    #[serde(default = "default_recursion_depth")]
    pub recursion_depth: usize,
    /// Mini-batch size of every recursion step.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for InfluenceConfig {
    fn default() -> Self {
        Self {
            recursion_depth: default_recursion_depth(),
            sample_size: default_sample_size(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracinConfig {
    /// Directory of training checkpoints; `<dir>/<architecture>/*.<extension>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default = "default_checkpoint_extension")]
    pub extension: String,
}

impl Default for TracinConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            extension: default_checkpoint_extension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptConfig {
    #[serde(default = "default_concept_set_size")]
    pub concept_set_size: usize,
    #[serde(default = "default_concept_epochs")]
    pub epochs: usize,
    #[serde(default = "default_concept_lr")]
    pub learning_rate: f64,
    /// Layer the concepts live in; the deepest probe layer when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

impl Default for ConceptConfig {
    fn default() -> Self {
        Self {
            concept_set_size: default_concept_set_size(),
            epochs: default_concept_epochs(),
            learning_rate: default_concept_lr(),
            layer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvarianceConfig {
    #[serde(default)]
    pub similarity: Similarity,
    /// Sample counts swept by the invariance-enforcement experiment.
    #[serde(default = "default_n_inv")]
    pub n_inv: Vec<usize>,
    #[serde(default)]
    pub sampling: GroupSampling,
    /// Group the invariant explainers average over; `symmetry.group` when
    /// unset. Invariance is always measured under `symmetry.group`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapping_group: Option<GroupKind>,
}

impl Default for InvarianceConfig {
    fn default() -> Self {
        Self {
            similarity: Similarity::default(),
            n_inv: default_n_inv(),
            sampling: GroupSampling::default(),
            wrapping_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityConfig {
    #[serde(default = "default_radius")]
    pub radius: f64,
    #[serde(default = "default_samples")]
    pub samples: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            samples: default_samples(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_n_train() -> usize {
    100
}

fn default_n_test() -> usize {
    100
}

fn default_signal_length() -> usize {
    32
}

fn default_classes() -> usize {
    2
}

fn default_noise() -> f64 {
    0.1
}

fn default_batch_size() -> usize {
    50
}

fn default_seed() -> u64 {
    42
}

fn default_architectures() -> Vec<Architecture> {
    vec![Architecture::InvariantCnn, Architecture::StandardCnn]
}

fn default_hidden() -> usize {
    32
}

fn default_load_mode() -> LoadMode {
    LoadMode::Lenient
}

fn default_occlusion_window() -> usize {
    3
}

fn default_simplex_epochs() -> usize {
    crate::explain::simplex::DEFAULT_EPOCHS
}

fn default_simplex_lr() -> f64 {
    crate::explain::simplex::DEFAULT_LR
}

fn default_recursion_depth() -> usize {
    100
}

fn default_sample_size() -> usize {
    32
}

fn default_checkpoint_extension() -> String {
    "ckpt".to_string()
}

fn default_concept_set_size() -> usize {
    20
}

fn default_concept_epochs() -> usize {
    200
}

fn default_concept_lr() -> f64 {
    1e-2
}

fn default_ig_steps() -> usize {
    50
}

fn default_shap_samples() -> usize {
    5
}

fn default_n_inv() -> Vec<usize> {
    vec![1, 5, 20, 50, 100]
}

fn default_radius() -> f64 {
    crate::robustness::DEFAULT_RADIUS
}

fn default_samples() -> usize {
    crate::robustness::DEFAULT_SAMPLES
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

impl EquivexConfig {
    /// Reject settings no experiment can run with.
    pub fn validate(&self) -> Result<()> {
        if self.data.batch_size == 0 {
            return Err(XaiError::config("data.batch_size must be positive"));
        }
        if self.data.classes < 2 {
            return Err(XaiError::config("data.classes must be at least 2"));
        }
        if self.model.architectures.is_empty() {
            return Err(XaiError::config("model.architectures is empty"));
        }
        if self.model.hidden == 0 {
            return Err(XaiError::config("model.hidden must be positive"));
        }
        if self.influence.sample_size == 0 {
            return Err(XaiError::config("influence.sample_size must be positive"));
        }
        if self.feature.ig_steps == 0 || self.feature.shap_samples == 0 {
            return Err(XaiError::config("feature.ig_steps and feature.shap_samples must be positive"));
        }
        if self.invariance.n_inv.contains(&0) {
            return Err(XaiError::config("invariance.n_inv values must be positive"));
        }
        if !self.sensitivity.radius.is_finite() || self.sensitivity.radius < 0.0 {
            return Err(XaiError::config("sensitivity.radius must be a non-negative number"));
        }
        if matches!(self.invariance.sampling, GroupSampling::Sampled { n: 0, .. }) {
            return Err(XaiError::config("invariance.sampling.n must be positive"));
        }
        Ok(())
    }
}

/// Dotted-key overrides applied after every other layer, e.g. from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    entries: Vec<(String, Value)>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override `key` (a dotted path such as `"data.batch_size"`).
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    /// Like [`ConfigOverrides::set`], skipping `None`.
    pub fn set_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// User-level configuration directory.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "equivex", "equivex").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration by merging defaults, config files, environment
/// variables (`EQUIVEX_DATA__BATCH_SIZE`, ...) and overrides.
pub fn load_config(workspace: Option<&Path>, overrides: &ConfigOverrides) -> Result<EquivexConfig> {
    let mut figment = Figment::from(Serialized::defaults(EquivexConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".equivex").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("EQUIVEX_").split("__"));

    for (key, value) in &overrides.entries {
        figment = figment.merge(Serialized::default(key, value.clone()));
    }

    let config: EquivexConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}
