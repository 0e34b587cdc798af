//! Named-layer sequential classifier and preset architectures.

use std::collections::HashSet;

use ndarray::{Array2, Array4};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{Conv2d, DihedralLift, Layer, Linear, TapedShape};
use super::state::{LoadMode, LoadReport, StateDict};
use super::Classifier;
use crate::autograd::{Tape, Var};
use crate::error::{Result, XaiError};
use crate::hooks::{Activation, HookRegistry};
use crate::tensor::flatten_batch;

/// Preset architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Mlp,
    /// Convolution followed by dense layers; not invariant to anything.
    StandardCnn,
    /// Circular convolutions and global pooling; exactly invariant to cyclic
    /// translations.
    InvariantCnn,
    /// D4 lifting convolution and group pooling; exactly invariant to the
    /// dihedral group.
    DihedralCnn,
}

impl Architecture {
    /// Name used in result tables.
    pub fn label(self) -> &'static str {
        match self {
            Architecture::Mlp => "MLP",
            Architecture::StandardCnn => "Standard-CNN",
            Architecture::InvariantCnn => "Invariant-CNN",
            Architecture::DihedralCnn => "Dihedral-CNN",
        }
    }

    /// Hidden layers probed by representation-based explainers, shallowest
    /// first.
    pub fn probe_layers(self) -> &'static [&'static str] {
        match self {
            Architecture::Mlp => &["fc1"],
            Architecture::StandardCnn => &["conv1", "fc1"],
            Architecture::InvariantCnn => &["conv2", "pool"],
            Architecture::DihedralCnn => &["pool", "fc1"],
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Layers applied in order. The last layer is always [`Layer::Linear`].
pub struct Sequential {
    layers: Vec<(String, Layer)>,
    hooks: HookRegistry,
}

impl Clone for Sequential {
    /// Clones start with no captures attached.
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
            hooks: HookRegistry::new(),
        }
    }
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|(name, layer)| (name, layer.kind())))
            .finish()
    }
}

impl Sequential {
    pub fn new(layers: Vec<(String, Layer)>) -> Result<Self> {
        let mut seen = HashSet::new();
        for (name, _) in &layers {
            if !seen.insert(name.as_str()) {
                return Err(XaiError::model(format!("duplicate layer name {name}")));
            }
        }
        match layers.last() {
            Some((_, Layer::Linear(_))) => Ok(Self::assemble(layers)),
            _ => Err(XaiError::model("the last layer must be linear")),
        }
    }

    fn assemble(layers: Vec<(String, Layer)>) -> Self {
        Self {
            layers,
            hooks: HookRegistry::new(),
        }
    }

    /// Build a preset for inputs of `shape` `(channels, height, width)`.
    pub fn build(
        architecture: Architecture,
        shape: (usize, usize, usize),
        hidden: usize,
        classes: usize,
        seed: u64,
    ) -> Self {
        let (channels, h, w) = shape;
        match architecture {
            Architecture::Mlp => Self::mlp(channels * h * w, &[hidden], classes, seed),
            Architecture::StandardCnn => Self::standard_cnn(shape, hidden, classes, seed),
            Architecture::InvariantCnn => Self::invariant_cnn(channels, hidden, classes, seed),
            Architecture::DihedralCnn => Self::dihedral_cnn(channels, hidden, classes, seed),
        }
    }

    /// `flatten → fc1 → relu1 → … → out`.
    pub fn mlp(in_features: usize, hidden: &[usize], classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = vec![("flatten".to_string(), Layer::Flatten)];
        let mut width = in_features;
        for (i, &h) in hidden.iter().enumerate() {
            layers.push((format!("fc{}", i + 1), Layer::Linear(Linear::new(width, h, &mut rng))));
            layers.push((format!("relu{}", i + 1), Layer::Relu));
            width = h;
        }
        layers.push(("out".into(), Layer::Linear(Linear::new(width, classes, &mut rng))));
        Self::assemble(layers)
    }

    pub fn standard_cnn(shape: (usize, usize, usize), hidden: usize, classes: usize, seed: u64) -> Self {
        let (channels, h, w) = shape;
        let mut rng = StdRng::seed_from_u64(seed);
        let conv = Conv2d::new(channels, hidden, 3, &mut rng);
        let fc = Linear::new(hidden * h * w, hidden, &mut rng);
        let out = Linear::new(hidden, classes, &mut rng);
        Self::assemble(vec![
            ("conv1".into(), Layer::Conv2d(conv)),
            ("relu1".into(), Layer::Relu),
            ("flatten".into(), Layer::Flatten),
            ("fc1".into(), Layer::Linear(fc)),
            ("relu2".into(), Layer::Relu),
            ("out".into(), Layer::Linear(out)),
        ])
    }

    pub fn invariant_cnn(channels: usize, hidden: usize, classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let conv1 = Conv2d::new(channels, hidden, 3, &mut rng);
        let conv2 = Conv2d::new(hidden, hidden, 3, &mut rng);
        let out = Linear::new(hidden, classes, &mut rng);
        Self::assemble(vec![
            ("conv1".into(), Layer::Conv2d(conv1)),
            ("relu1".into(), Layer::Relu),
            ("conv2".into(), Layer::Conv2d(conv2)),
            ("relu2".into(), Layer::Relu),
            ("pool".into(), Layer::GlobalAvgPool),
            ("out".into(), Layer::Linear(out)),
        ])
    }

    pub fn dihedral_cnn(channels: usize, hidden: usize, classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let lift = DihedralLift::new(channels, hidden, 3, &mut rng);
        let fc = Linear::new(hidden, hidden, &mut rng);
        let out = Linear::new(hidden, classes, &mut rng);
        Self::assemble(vec![
            ("lift".into(), Layer::DihedralLift(lift)),
            ("relu1".into(), Layer::Relu),
            ("pool".into(), Layer::GroupPool),
            ("fc1".into(), Layer::Linear(fc)),
            ("relu2".into(), Layer::Relu),
            ("out".into(), Layer::Linear(out)),
        ])
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.layers.iter().map(|(name, layer)| (name.as_str(), layer))
    }

    fn run(&self, x: &Array4<f64>, stop: usize) -> Result<Activation> {
        let mut current = Activation::Spatial(x.clone());
        for (name, layer) in &self.layers[..stop] {
            current = layer.forward(current).map_err(|e| {
                XaiError::model(format!("layer {name}: {e}"))
            })?;
            self.hooks.record(name, &current);
        }
        Ok(current)
    }
}

impl Sequential {
    /// Logits of flattened `(channels, h, w)` inputs recorded on the input's
    /// tape.
    pub fn forward_on_tape(&self, input: &Var, shape: (usize, usize, usize)) -> Result<Var> {
        let (c, h, w) = shape;
        let mut current = (input.clone(), TapedShape::Spatial(c, h, w));
        for (name, layer) in &self.layers {
            current = layer
                .forward_on_tape(&current.0, current.1)
                .map_err(|e| XaiError::model(format!("layer {name}: {e}")))?;
        }
        Ok(current.0)
    }
}

impl Classifier for Sequential {
    fn forward(&self, x: &Array4<f64>) -> Result<Array2<f64>> {
        Ok(self.run(x, self.layers.len())?.flatten())
    }

    fn penultimate(&self, x: &Array4<f64>) -> Result<Array2<f64>> {
        Ok(self.run(x, self.layers.len() - 1)?.flatten())
    }

    fn last_layer(&self) -> &Linear {
        match self.layers.last() {
            Some((_, Layer::Linear(linear))) => linear,
            _ => unreachable!("Sequential is always built with a linear last layer"),
        }
    }

    fn last_layer_name(&self) -> &str {
        self.layers.last().map(|(name, _)| name.as_str()).unwrap_or_default()
    }

    fn named_layer(&self, name: &str) -> Result<&Layer> {
        self.layers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, layer)| layer)
            .ok_or_else(|| XaiError::not_found(format!("layer {name}")))
    }

    fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn state_dict(&self) -> StateDict {
        self.layers
            .iter()
            .flat_map(|(name, layer)| layer.params(name))
            .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict, mode: LoadMode) -> Result<LoadReport> {
        let own = self.state_dict();
        let mut report = LoadReport::default();
        for (key, current) in &own {
            match state.get(key) {
                Some(value) if value.shape != current.shape => {
                    return Err(XaiError::checkpoint(format!(
                        "{key}: checkpoint shape {:?}, model shape {:?}",
                        value.shape, current.shape
                    )));
                }
                Some(_) => report.loaded.push(key.clone()),
                None => report.missing.push(key.clone()),
            }
        }
        report.unexpected = state
            .keys()
            .filter(|k| !own.contains_key(*k))
            .cloned()
            .collect();

        if !report.is_complete() {
            match mode {
                LoadMode::Strict => {
                    return Err(XaiError::checkpoint(format!(
                        "state dict mismatch: missing [{}], unexpected [{}]",
                        report.missing.join(", "),
                        report.unexpected.join(", ")
                    )));
                }
                LoadMode::Lenient => tracing::warn!(
                    missing = ?report.missing,
                    unexpected = ?report.unexpected,
                    "loading state dict leniently"
                ),
            }
        }

        for key in &report.loaded {
            let Some((layer_name, field)) = key.rsplit_once('.') else {
                continue;
            };
            let layer = self
                .layers
                .iter_mut()
                .find(|(n, _)| n == layer_name)
                .map(|(_, layer)| layer)
                .ok_or_else(|| XaiError::not_found(format!("layer {layer_name}")))?;
            if let Some(value) = state.get(key) {
                layer.set_param(field, value)?;
            }
        }
        Ok(report)
    }

    fn input_gradients(&self, x: &Array4<f64>, targets: &[usize]) -> Result<Array4<f64>> {
        let (n, c, h, w) = x.dim();
        if targets.len() != n {
            return Err(XaiError::shape(format!("{n} inputs but {} targets", targets.len())));
        }
        let classes = self.num_classes();
        if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
            return Err(XaiError::invalid_input(format!(
                "target {bad} out of range for {classes} classes"
            )));
        }
        let tape = Tape::new();
        let input = tape.leaf(flatten_batch(x));
        let logits = self.forward_on_tape(&input, (c, h, w))?;
        let picked = Array2::from_shape_fn((n, classes), |(i, k)| if targets[i] == k { 1.0 } else { 0.0 });
        let objective = (&logits * &tape.constant(picked)).sum();
        let grad = tape
            .grad(&objective, &[input])?
            .pop()
            .ok_or_else(|| XaiError::model("no gradient recorded for the input"))?;
        grad.value()
            .into_shape_with_order((n, c, h, w))
            .map_err(|e| XaiError::shape(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symmetry::{Dihedral, SymmetryGroup, Translation2D};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn image(n: usize, size: usize) -> Array4<f64> {
        Array4::from_shape_fn((n, 1, size, size), |(b, _, i, j)| {
            ((b * 13 + i * 5 + j * 3) % 7) as f64 / 7.0
        })
    }

    #[test]
    fn test_mlp_layer_names() {
        let model = Sequential::mlp(4, &[3, 3], 2, 0);
        assert_eq!(
            model.layer_names(),
            vec!["flatten", "fc1", "relu1", "fc2", "relu2", "out"]
        );
        assert_eq!(model.last_layer_name(), "out");
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_new_requires_linear_head() {
        assert!(Sequential::new(vec![("relu".into(), Layer::Relu)]).is_err());
    }

    #[test]
    fn test_penultimate_feeds_last_layer() {
        let model = Sequential::standard_cnn((1, 4, 4), 3, 2, 5);
        let x = image(2, 4);
        let h = model.penultimate(&x).unwrap();
        let logits = model.last_layer().forward(&h).unwrap();
        assert_eq!(logits, model.forward(&x).unwrap());
    }

    #[test]
    fn test_invariant_cnn_is_translation_invariant() {
        let model = Sequential::invariant_cnn(1, 3, 2, 8);
        let x = image(2, 5);
        let group = Translation2D::new(None);
        let base = model.forward(&x).unwrap();
        for shift in group.elements((2, 1, 5, 5)).unwrap() {
            let y = model.forward(&group.apply(&x, &shift).unwrap()).unwrap();
            for (a, b) in base.iter().zip(y.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_dihedral_cnn_is_dihedral_invariant() {
        let model = Sequential::dihedral_cnn(1, 2, 3, 21);
        let x = image(1, 4);
        let base = model.forward(&x).unwrap();
        for e in Dihedral.elements((1, 1, 4, 4)).unwrap() {
            let y = model.forward(&Dihedral.apply(&x, &e).unwrap()).unwrap();
            for (a, b) in base.iter().zip(y.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_strict_load_rejects_mismatch() {
        let mut model = Sequential::mlp(4, &[3], 2, 0);
        let mut state = Sequential::mlp(4, &[3], 2, 1).state_dict();
        state.remove("fc1.bias");
        let before = model.state_dict();
        assert!(model.load_state_dict(&state, LoadMode::Strict).is_err());
        assert_eq!(model.state_dict(), before);
    }

    #[test]
    fn test_lenient_load_reports_and_applies() {
        let mut model = Sequential::mlp(4, &[3], 2, 0);
        let donor = Sequential::mlp(4, &[3], 2, 1);
        let mut state = donor.state_dict();
        state.remove("fc1.bias");
        state.insert("extra.weight".into(), state["out.bias"].clone());
        let report = model.load_state_dict(&state, LoadMode::Lenient).unwrap();
        assert_eq!(report.missing, vec!["fc1.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["extra.weight".to_string()]);
        assert_eq!(model.last_layer(), donor.last_layer());
    }

    #[test]
    fn test_shape_mismatch_is_always_error() {
        let mut model = Sequential::mlp(4, &[3], 2, 0);
        let state = Sequential::mlp(4, &[5], 2, 0).state_dict();
        assert!(model.load_state_dict(&state, LoadMode::Lenient).is_err());
    }

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.dim(), b.dim());
        for (p, q) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(p, q, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_taped_forward_matches_plain_forward() {
        let x = image(3, 4);
        for model in [
            Sequential::mlp(16, &[5], 3, 2),
            Sequential::standard_cnn((1, 4, 4), 4, 3, 2),
            Sequential::invariant_cnn(1, 3, 3, 2),
            Sequential::dihedral_cnn(1, 2, 3, 2),
        ] {
            let tape = Tape::new();
            let taped = model.forward_on_tape(&tape.constant(flatten_batch(&x)), (1, 4, 4)).unwrap();
            assert_close(&taped.value(), &model.forward(&x).unwrap());
        }
    }

    #[test]
    fn test_input_gradients_match_finite_differences() {
        let model = Sequential::standard_cnn((1, 4, 4), 3, 2, 9);
        let x = image(2, 4);
        let targets = [1, 0];
        let grads = model.input_gradients(&x, &targets).unwrap();
        assert_eq!(grads.dim(), x.dim());
        let eps = 1e-6;
        for (b, i, j) in [(0, 0, 0), (0, 2, 3), (1, 1, 1), (1, 3, 2)] {
            let mut up = x.clone();
            up[[b, 0, i, j]] += eps;
            let mut down = x.clone();
            down[[b, 0, i, j]] -= eps;
            let t = targets[b];
            let numeric = (model.forward(&up).unwrap()[[b, t]] - model.forward(&down).unwrap()[[b, t]]) / (2.0 * eps);
            assert_abs_diff_eq!(grads[[b, 0, i, j]], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_input_gradients_reject_bad_targets() {
        let model = Sequential::mlp(16, &[3], 2, 0);
        let x = image(2, 4);
        assert!(model.input_gradients(&x, &[0]).is_err());
        assert!(model.input_gradients(&x, &[0, 2]).is_err());
    }

    #[test]
    fn test_clone_has_no_captures() {
        let model = Sequential::mlp(4, &[3], 2, 0);
        let _capture = crate::hooks::ActivationCapture::attach(&model, "fc1").unwrap();
        assert_eq!(model.clone().hooks().active(), 0);
    }
}
