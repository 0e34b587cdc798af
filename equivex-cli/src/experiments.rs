//! Experiment drivers behind the measurement subcommands.
//!
//! Every experiment loads the configured data, builds each configured
//! architecture, measures against the configured symmetry group and writes
//! one [`MetricsTable`] to `<output.dir>/<experiment>/`.

use anyhow::{Context as _, bail};
use equivex_ml::config::{EquivexConfig, GroupKind, SymmetryConfig};
use equivex_ml::data::synthetic::{shifted_patterns, shifted_squares};
use equivex_ml::explain::{
    CheckpointReplay, ConceptClassifier, ConceptExplainer, FeatureAblation, FeatureOcclusion, FeaturePermutation,
    GradientShap, InfluenceFunctions, IntegratedGradients, RepresentationSimilarity, SimplEx, TracIn,
};
use equivex_ml::model::read_checkpoint;
use equivex_ml::robustness::pearson_correlation;
use equivex_ml::symmetry::{AnchoredTranslation2D, Dihedral, Translation1D, Translation2D};
use equivex_ml::{
    Aggregation, Architecture, Classifier, Dataset, Explainer, FeatureExplainer, InvariantExplainer, MetricsTable,
    Sequential, Similarity, SymmetryGroup, TableKind, explanation_equivariance, explanation_invariance,
    explanation_sensitivity, model_invariance,
};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Largest displacement of the anchored group when none is configured.
const DEFAULT_ANCHORED_DISPLACEMENT: usize = 3;

/// Everything an experiment reads.
pub struct Context {
    pub config: EquivexConfig,
    pub train: Dataset,
    pub test: Dataset,
    /// `<output.dir>/<experiment>`; caches live below it.
    pub save_dir: PathBuf,
}

impl Context {
    fn batch_size(&self) -> usize {
        self.config.data.batch_size
    }

    fn similarity(&self) -> Similarity {
        self.config.invariance.similarity
    }

    /// Build `architecture` for the test inputs and load its checkpoint if
    /// one is configured.
    fn model(&self, architecture: Architecture) -> anyhow::Result<Sequential> {
        let (_, channels, h, w) = self.test.shape();
        let classes = self.config.data.classes.max(self.train.num_classes());
        let mut model = Sequential::build(
            architecture,
            (channels, h, w),
            self.config.model.hidden,
            classes,
            self.config.model.seed,
        );
        let Some(dir) = &self.config.model.checkpoint_dir else {
            return Ok(model);
        };
        let path = dir.join(format!("{}.ckpt", slug(architecture)));
        if !path.exists() {
            warn!(path = %path.display(), "No checkpoint found, using initial parameters");
            return Ok(model);
        }
        let state = read_checkpoint(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let report = model
            .load_state_dict(&state, self.config.model.load_mode)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        report.require_layer(model.last_layer_name())?;
        info!(
            model = architecture.label(),
            loaded = report.loaded.len(),
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "Checkpoint loaded"
        );
        Ok(model)
    }

    fn cache_dir(&self, architecture: Architecture) -> PathBuf {
        self.save_dir.join(slug(architecture))
    }

    /// Occlusion window and stride: strips along 1-D signals, squares on
    /// images.
    fn occlusion_geometry(&self) -> ((usize, usize), (usize, usize)) {
        let feature = &self.config.feature;
        let (_, _, h, _) = self.test.shape();
        if h == 1 {
            ((1, feature.occlusion_window), (1, feature.occlusion_stride))
        } else {
            (
                (feature.occlusion_window, feature.occlusion_window),
                (feature.occlusion_stride, feature.occlusion_stride),
            )
        }
    }

    fn feature_explainers<'m>(&self, model: &'m Sequential) -> Vec<Box<dyn FeatureExplainer + 'm>> {
        let (window, stride) = self.occlusion_geometry();
        let feature = &self.config.feature;
        vec![
            Box::new(
                IntegratedGradients::new(model)
                    .with_baseline(feature.baseline)
                    .with_steps(feature.ig_steps),
            ),
            Box::new(GradientShap::new(model, self.config.data.seed).with_samples(feature.shap_samples)),
            Box::new(FeatureAblation::new(model).with_baseline(feature.baseline)),
            Box::new(FeaturePermutation::new(model, self.config.data.seed)),
            Box::new(FeatureOcclusion::new(model, window, stride)),
        ]
    }

    /// Concept explainers fitted on the training set, CAV first.
    fn concept_explainers<'m>(
        &self,
        model: &'m Sequential,
        architecture: Architecture,
    ) -> anyhow::Result<Vec<ConceptExplainer<'m, Sequential>>> {
        let concepts = &self.config.concepts;
        let layer = concepts
            .layer
            .clone()
            .or_else(|| architecture.probe_layers().last().map(|l| l.to_string()))
            .unwrap_or_else(|| model.last_layer_name().to_string());
        let mut rng = StdRng::seed_from_u64(self.config.data.seed);
        let mut explainers = Vec::with_capacity(2);
        for kind in [ConceptClassifier::Cav, ConceptClassifier::Car] {
            let mut explainer = ConceptExplainer::new(model, &layer, kind, self.batch_size())?.with_training(
                concepts.epochs,
                concepts.learning_rate,
                self.config.data.seed,
            );
            explainer.fit(&self.train, concepts.concept_set_size, &mut rng)?;
            let accuracy = explainer.concept_accuracy(&self.test, concepts.concept_set_size, &mut rng)?;
            info!(
                model = architecture.label(),
                explainer = kind.label(),
                layer = %layer,
                accuracy = mean(&Array1::from(accuracy)),
                "Concept classifiers fitted"
            );
            explainers.push(explainer);
        }
        Ok(explainers)
    }
}

/// A measurement run against one symmetry group.
pub trait Experiment {
    /// Subdirectory of the output directory.
    const NAME: &'static str;

    fn kind(&self) -> TableKind;

    /// Rows for `architecture`.
    fn measure<G: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()>;
}

/// Load data, measure every configured architecture and write the table.
pub fn run_experiment<E: Experiment>(
    experiment: &E,
    config: &EquivexConfig,
    workspace: &Path,
) -> anyhow::Result<MetricsTable> {
    let (train, test) = load_data(config, workspace)?;
    info!(
        experiment = E::NAME,
        train = train.len(),
        test = test.len(),
        group = ?config.symmetry.group,
        "Starting experiment"
    );
    let ctx = Context {
        config: config.clone(),
        train,
        test,
        save_dir: resolve(workspace, &config.output.dir).join(E::NAME),
    };
    let symmetry = &config.symmetry;
    let table = match symmetry.group {
        GroupKind::Translation1d => measure_all(experiment, &ctx, &Translation1D::new(symmetry.n_steps))?,
        GroupKind::Translation2d => measure_all(experiment, &ctx, &Translation2D::new(symmetry.max_displacement))?,
        GroupKind::Dihedral => measure_all(experiment, &ctx, &Dihedral)?,
        GroupKind::AnchoredTranslation2d => measure_all(experiment, &ctx, &anchored(symmetry))?,
    };

    for group_mean in table.group_means() {
        info!(
            model = %group_mean.model_type,
            explanation = %group_mean.explanation,
            reference = group_mean.reference,
            score = group_mean.score,
            rows = group_mean.count,
            "Result"
        );
    }
    let (csv, json) = table.write_all(&ctx.save_dir)?;
    info!(csv = %csv.display(), json = %json.display(), "Metrics written");
    Ok(table)
}

fn anchored(symmetry: &SymmetryConfig) -> AnchoredTranslation2D {
    AnchoredTranslation2D::new(symmetry.max_displacement.unwrap_or(DEFAULT_ANCHORED_DISPLACEMENT))
}

fn measure_all<E: Experiment, G: SymmetryGroup + Clone>(
    experiment: &E,
    ctx: &Context,
    group: &G,
) -> anyhow::Result<MetricsTable> {
    let mut table = MetricsTable::new(experiment.kind());
    for &architecture in &ctx.config.model.architectures {
        info!(model = architecture.label(), group = group.name(), "Now working with classifier");
        experiment
            .measure(ctx, group, architecture, &mut table)
            .with_context(|| format!("{} failed for {}", E::NAME, architecture.label()))?;
    }
    Ok(table)
}

/// Train and test sets: both from CSV, or both from the synthetic generator
/// matching the group's input geometry. The test set is capped at
/// `data.n_test` randomly chosen examples.
fn load_data(config: &EquivexConfig, workspace: &Path) -> anyhow::Result<(Dataset, Dataset)> {
    let data = &config.data;
    let (train, test) = match (&data.train_csv, &data.test_csv) {
        (Some(train), Some(test)) => {
            let read = |path: &PathBuf| {
                let path = resolve(workspace, path);
                Dataset::from_signal_csv(&path, data.binarize_labels)
                    .with_context(|| format!("Failed to read {}", path.display()))
            };
            (read(train)?, read(test)?)
        }
        (None, None) => {
            let n = data.n_train + data.n_test;
            let all = match config.symmetry.group {
                GroupKind::Translation1d => {
                    shifted_patterns(n, data.classes, data.signal_length, data.noise, data.seed)?
                }
                _ => shifted_squares(n, data.classes, data.signal_length, data.seed)?,
            };
            let test_indices: Vec<usize> = (data.n_train..n).collect();
            (all.head(data.n_train), all.subset(&test_indices)?)
        }
        _ => bail!("data.train_csv and data.test_csv must be set together"),
    };
    if train.is_empty() || test.is_empty() {
        bail!("Both the training and the test set need examples");
    }
    let mut rng = StdRng::seed_from_u64(data.seed);
    let test = if test.len() > data.n_test {
        test.random_subset(data.n_test, &mut rng)
    } else {
        test
    };
    Ok((train, test))
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// File-name form of an architecture, matching its config spelling.
fn slug(architecture: Architecture) -> &'static str {
    match architecture {
        Architecture::Mlp => "mlp",
        Architecture::StandardCnn => "standard_cnn",
        Architecture::InvariantCnn => "invariant_cnn",
        Architecture::DihedralCnn => "dihedral_cnn",
    }
}

fn mean(scores: &Array1<f64>) -> f64 {
    scores.mean().unwrap_or(f64::NAN)
}

fn model_invariance_for<G: SymmetryGroup>(
    ctx: &Context,
    model: &Sequential,
    group: &G,
    architecture: Architecture,
) -> anyhow::Result<Array1<f64>> {
    let scores = model_invariance(
        model,
        group,
        &ctx.test,
        ctx.batch_size(),
        ctx.config.invariance.sampling,
        ctx.similarity(),
    )?;
    info!(model = architecture.label(), invariance = mean(&scores), "Model invariance");
    Ok(scores)
}

/// Rows of one architecture, with its model invariance as the reference
/// column.
struct Recorder<'a> {
    ctx: &'a Context,
    table: &'a mut MetricsTable,
    model_type: &'a str,
    model_inv: &'a Array1<f64>,
}

impl Recorder<'_> {
    fn invariance<E: Explainer + ?Sized, G: SymmetryGroup>(
        &mut self,
        explainer: &mut E,
        label: &str,
        group: &G,
        similarity: Similarity,
    ) -> anyhow::Result<()> {
        info!(explainer = label, "Now working with explainer");
        let scores = explanation_invariance(
            explainer,
            group,
            &self.ctx.test,
            self.ctx.batch_size(),
            self.ctx.config.invariance.sampling,
            similarity,
        )?;
        info!(explainer = label, invariance = mean(&scores), "Explanation invariance");
        self.table.extend(self.model_type, label, self.model_inv, &scores)?;
        Ok(())
    }
}

/// Model invariance next to the equivariance of feature attributions.
pub struct FeatureImportance;

impl Experiment for FeatureImportance {
    const NAME: &'static str = "feature_importance";

    fn kind(&self) -> TableKind {
        TableKind::FeatureImportance
    }

    fn measure<G: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()> {
        let model = ctx.model(architecture)?;
        let model_inv = model_invariance_for(ctx, &model, group, architecture)?;
        for mut explainer in ctx.feature_explainers(&model) {
            let name = explainer.name().to_string();
            info!(explainer = %name, "Now working with explainer");
            let scores = explanation_equivariance(
                explainer.as_mut(),
                group,
                &ctx.test,
                ctx.batch_size(),
                ctx.config.invariance.sampling,
                ctx.similarity(),
            )?;
            info!(explainer = %name, equivariance = mean(&scores), "Explanation equivariance");
            table.extend(architecture.label(), &name, &model_inv, &scores)?;
        }
        Ok(())
    }
}

/// Model invariance next to the invariance of example importance scores.
pub struct ExampleImportance;

impl Experiment for ExampleImportance {
    const NAME: &'static str = "example_importance";

    fn kind(&self) -> TableKind {
        TableKind::ExampleImportance
    }

    fn measure<G: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()> {
        let mut model = ctx.model(architecture)?;
        let model_inv = model_invariance_for(ctx, &model, group, architecture)?;
        let model_type = architecture.label();
        let similarity = ctx.similarity();
        let mut rows = Recorder {
            ctx,
            table,
            model_type,
            model_inv: &model_inv,
        };

        for &layer in architecture.probe_layers() {
            let mut simplex = SimplEx::new(&model, layer, &ctx.train.x, ctx.batch_size())?
                .with_epochs(ctx.config.simplex.epochs)
                .with_learning_rate(ctx.config.simplex.learning_rate);
            let label = format!("{}-{layer}", simplex.name());
            rows.invariance(&mut simplex, &label, group, similarity)?;

            let mut representation = RepresentationSimilarity::new(&model, layer, &ctx.train.x, ctx.batch_size())?;
            let label = format!("{}-{layer}", representation.name());
            rows.invariance(&mut representation, &label, group, similarity)?;
        }

        let cache_dir = ctx.cache_dir(architecture);
        {
            let influence = &ctx.config.influence;
            let mut explainer = InfluenceFunctions::new(
                &model,
                ctx.train.clone(),
                &cache_dir,
                influence.recursion_depth,
                influence.sample_size,
                influence.seed,
            )?
            .with_batch_size(ctx.batch_size());
            let label = explainer.name().to_string();
            rows.invariance(&mut explainer, &label, group, similarity)?;
        }

        match &ctx.config.tracin.checkpoint_dir {
            Some(dir) => {
                let dir = dir.join(slug(architecture));
                let replay = CheckpointReplay::from_dir(&dir, &ctx.config.tracin.extension, ctx.config.model.load_mode)
                    .with_context(|| format!("Failed to list checkpoints in {}", dir.display()))?;
                let mut tracin = TracIn::new(&mut model, ctx.train.clone(), replay, &cache_dir, ctx.batch_size())?;
                let label = tracin.name().to_string();
                rows.invariance(&mut tracin, &label, group, similarity)?;
            }
            None => info!(model = model_type, "No training checkpoints configured, skipping TracIn"),
        }
        Ok(())
    }
}

/// Concept accuracy plus the invariance of concept membership.
pub struct ConceptImportance;

impl Experiment for ConceptImportance {
    const NAME: &'static str = "concept_importance";

    fn kind(&self) -> TableKind {
        TableKind::ConceptImportance
    }

    fn measure<G: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()> {
        let model = ctx.model(architecture)?;
        let model_inv = model_invariance_for(ctx, &model, group, architecture)?;
        let mut rows = Recorder {
            ctx,
            table,
            model_type: architecture.label(),
            model_inv: &model_inv,
        };
        for mut explainer in ctx.concept_explainers(&model, architecture)? {
            let label = explainer.name().to_string();
            rows.invariance(&mut explainer, &label, group, Similarity::Accuracy)?;
        }
        Ok(())
    }
}

/// Concept explainers wrapped in [`InvariantExplainer`] for every configured
/// sample count. The wrappers average over `invariance.wrapping_group` and are
/// measured under `symmetry.group`.
pub struct EnforceInvariance;

impl EnforceInvariance {
    fn sweep<G: SymmetryGroup, W: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        wrapping: &W,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()> {
        let model = ctx.model(architecture)?;
        model_invariance_for(ctx, &model, group, architecture)?;
        for mut explainer in ctx.concept_explainers(&model, architecture)? {
            for &n_inv in &ctx.config.invariance.n_inv {
                let mut wrapped = InvariantExplainer::new(explainer, wrapping.clone(), n_inv)
                    .with_aggregation(Aggregation::MajorityVote)
                    .with_seed(ctx.config.data.seed);
                let scores = explanation_invariance(
                    &mut wrapped,
                    group,
                    &ctx.test,
                    ctx.batch_size(),
                    ctx.config.invariance.sampling,
                    Similarity::Accuracy,
                )?;
                info!(
                    explainer = wrapped.name(),
                    wrapping = wrapping.name(),
                    n_inv,
                    invariance = mean(&scores),
                    "Invariant explainer"
                );
                table.extend_constant(architecture.label(), wrapped.name(), n_inv as f64, &scores);
                explainer = wrapped.into_inner();
            }
        }
        Ok(())
    }
}

impl Experiment for EnforceInvariance {
    const NAME: &'static str = "enforce_invariance";

    fn kind(&self) -> TableKind {
        TableKind::EnforceInvariance
    }

    fn measure<G: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()> {
        let symmetry = &ctx.config.symmetry;
        match ctx.config.invariance.wrapping_group {
            None => self.sweep(ctx, group, group, architecture, table),
            Some(GroupKind::Translation1d) => {
                self.sweep(ctx, group, &Translation1D::new(symmetry.n_steps), architecture, table)
            }
            Some(GroupKind::Translation2d) => {
                self.sweep(ctx, group, &Translation2D::new(symmetry.max_displacement), architecture, table)
            }
            Some(GroupKind::Dihedral) => self.sweep(ctx, group, &Dihedral, architecture, table),
            Some(GroupKind::AnchoredTranslation2d) => self.sweep(ctx, group, &anchored(symmetry), architecture, table),
        }
    }
}

/// Sensitivity of feature attributions next to their equivariance.
pub struct Sensitivity;

impl Experiment for Sensitivity {
    const NAME: &'static str = "sensitivity";

    fn kind(&self) -> TableKind {
        TableKind::Sensitivity
    }

    fn measure<G: SymmetryGroup + Clone>(
        &self,
        ctx: &Context,
        group: &G,
        architecture: Architecture,
        table: &mut MetricsTable,
    ) -> anyhow::Result<()> {
        let model = ctx.model(architecture)?;
        let sensitivity = &ctx.config.sensitivity;
        for mut explainer in ctx.feature_explainers(&model) {
            let name = explainer.name().to_string();
            let sens = explanation_sensitivity(
                explainer.as_mut(),
                &ctx.test,
                ctx.batch_size(),
                sensitivity.radius,
                sensitivity.samples,
                sensitivity.seed,
            )?;
            let equiv = explanation_equivariance(
                explainer.as_mut(),
                group,
                &ctx.test,
                ctx.batch_size(),
                ctx.config.invariance.sampling,
                ctx.similarity(),
            )?;
            info!(
                model = architecture.label(),
                explainer = %name,
                sensitivity = mean(&sens),
                equivariance = mean(&equiv),
                correlation = pearson_correlation(&sens, &equiv)?,
                "Sensitivity against equivariance"
            );
            table.extend(architecture.label(), &name, &sens, &equiv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equivex_ml::ConfigOverrides;
    use equivex_ml::model::write_checkpoint;
    use pretty_assertions::assert_eq;

    fn small_config(output: &Path) -> EquivexConfig {
        let mut config = EquivexConfig::default();
        config.data.n_train = 6;
        config.data.n_test = 4;
        config.data.signal_length = 8;
        config.data.batch_size = 4;
        config.model.architectures = vec![Architecture::InvariantCnn];
        config.model.hidden = 3;
        config.simplex.epochs = 5;
        config.influence.recursion_depth = 2;
        config.influence.sample_size = 3;
        config.concepts.concept_set_size = 2;
        config.concepts.epochs = 5;
        config.invariance.n_inv = vec![1, 8];
        config.sensitivity.samples = 2;
        config.output.dir = output.to_path_buf();
        config
    }

    #[test]
    fn test_synthetic_split_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let (train, test) = load_data(&config, dir.path()).unwrap();
        assert_eq!(train.len(), 6);
        assert_eq!(test.len(), 4);
        assert_eq!(test.shape(), (4, 1, 1, 8));
    }

    #[test]
    fn test_image_groups_get_square_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.symmetry.group = GroupKind::Dihedral;
        let (_, test) = load_data(&config, dir.path()).unwrap();
        assert_eq!(test.shape(), (4, 1, 8, 8));
    }

    #[test]
    fn test_half_configured_csv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.data.train_csv = Some(PathBuf::from("train.csv"));
        assert!(load_data(&config, dir.path()).is_err());
    }

    #[test]
    fn test_csv_data_is_read_relative_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let rows = "0,0,1,1,0,0,0,0,0\n0,0,0,1,1,1,0,0,1\n1,1,0,0,0,0,0,0,0\n0,0,0,0,1,1,1,0,2\n";
        std::fs::write(dir.path().join("train.csv"), rows).unwrap();
        std::fs::write(dir.path().join("test.csv"), rows).unwrap();
        let mut config = small_config(dir.path());
        config.data.train_csv = Some(PathBuf::from("train.csv"));
        config.data.test_csv = Some(PathBuf::from("test.csv"));
        config.data.n_test = 2;
        let (train, test) = load_data(&config, dir.path()).unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(train.num_classes(), 2);
        assert_eq!(test.len(), 2);
    }

    #[test]
    fn test_feature_importance_writes_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let table = run_experiment(&FeatureImportance, &config, dir.path()).unwrap();
        // five feature explainers, four test examples
        assert_eq!(table.len(), 20);
        assert!(table.records().iter().all(|r| (r.reference - 1.0).abs() < 1e-9));
        let explanations: Vec<String> = table.group_means().into_iter().map(|m| m.explanation).collect();
        assert!(explanations.iter().any(|e| e == "Integrated Gradients"));
        assert!(explanations.iter().any(|e| e == "Gradient Shap"));

        let csv = dir.path().join("feature_importance").join("metrics.csv");
        let text = std::fs::read_to_string(csv).unwrap();
        assert!(text.starts_with("Model Type,Explanation,Model Invariance,Explanation Equivariance\n"));
        assert!(dir.path().join("feature_importance").join("metrics.json").exists());
    }

    #[test]
    fn test_example_importance_covers_probe_layers_and_tracin() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        let checkpoints = dir.path().join("checkpoints").join("invariant_cnn");
        for seed in [1, 2] {
            let state = Sequential::invariant_cnn(1, 3, 2, seed).state_dict();
            write_checkpoint(&checkpoints.join(format!("epoch_{seed}.ckpt")), &state, Some(seed)).unwrap();
        }
        config.tracin.checkpoint_dir = Some(dir.path().join("checkpoints"));
        config.invariance.sampling = equivex_ml::GroupSampling::Sampled { n: 2, seed: 0 };

        let table = run_experiment(&ExampleImportance, &config, dir.path()).unwrap();
        let explanations: Vec<String> = table.group_means().into_iter().map(|m| m.explanation).collect();
        for expected in [
            "SimplEx-conv2",
            "Representation Similarity-conv2",
            "SimplEx-pool",
            "Representation Similarity-pool",
            "Influence Functions",
            "TracIn",
        ] {
            assert!(explanations.iter().any(|e| e == expected), "missing {expected}");
        }
        assert_eq!(table.len(), 6 * 4);
    }

    #[test]
    fn test_enforce_invariance_sweeps_sample_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let table = run_experiment(&EnforceInvariance, &config, dir.path()).unwrap();
        // two concept explainers, two sample counts, four test examples
        assert_eq!(table.len(), 16);
        let full_orbit: Vec<_> = table.records().iter().filter(|r| r.reference == 8.0).collect();
        assert!(full_orbit.iter().all(|r| (r.score - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_enforce_invariance_with_anchored_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.symmetry.group = GroupKind::AnchoredTranslation2d;
        config.symmetry.max_displacement = Some(1);
        config.invariance.n_inv = vec![2];
        let table = run_experiment(&EnforceInvariance, &config, dir.path()).unwrap();
        assert_eq!(table.len(), 2 * 4);
    }

    #[test]
    fn test_enforce_invariance_wraps_anchored_measures_translation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.symmetry.group = GroupKind::Translation2d;
        config.symmetry.max_displacement = Some(1);
        config.invariance.wrapping_group = Some(GroupKind::AnchoredTranslation2d);
        config.invariance.n_inv = vec![1, 9];
        let table = run_experiment(&EnforceInvariance, &config, dir.path()).unwrap();
        assert_eq!(table.len(), 2 * 2 * 4);
        assert!(table.records().iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_feature_importance_with_anchored_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.symmetry.group = GroupKind::AnchoredTranslation2d;
        config.symmetry.max_displacement = Some(1);
        config.feature.ig_steps = 4;
        config.feature.shap_samples = 2;
        let table = run_experiment(&FeatureImportance, &config, dir.path()).unwrap();
        assert_eq!(table.len(), 20);
    }

    #[test]
    fn test_missing_checkpoint_falls_back_to_initial_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.model.checkpoint_dir = Some(dir.path().join("nowhere"));
        let (train, test) = load_data(&config, dir.path()).unwrap();
        let ctx = Context {
            config,
            train,
            test,
            save_dir: dir.path().to_path_buf(),
        };
        let model = ctx.model(Architecture::InvariantCnn).unwrap();
        assert_eq!(model.state_dict(), Sequential::invariant_cnn(1, 3, 2, 42).state_dict());
    }

    #[test]
    fn test_overrides_reach_experiments() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = ConfigOverrides::new().set("data.n_test", 3u64).set("output.dir", "out");
        let config = equivex_ml::load_config(Some(dir.path()), &overrides).unwrap();
        assert_eq!(config.data.n_test, 3);
        assert_eq!(resolve(dir.path(), &config.output.dir), dir.path().join("out"));
    }
}
