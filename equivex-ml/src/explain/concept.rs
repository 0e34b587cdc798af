//! Concept-based explanations over a hooked layer.
//!
//! One concept per class: the positive set is a sample of examples of that
//! class, the negative set a sample of all other examples. A concept
//! classifier fitted on their representations decides, for a new input,
//! whether its representation lies in the concept.

use ndarray::{Array1, Array2, Array4, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::Explainer;
use super::similarity::capture_batched;
use crate::autograd::{Adam, Tape, cross_entropy};
use crate::data::Dataset;
use crate::error::{Result, XaiError};
use crate::hooks::ActivationCapture;
use crate::model::{Classifier, Linear};
use crate::tensor::argmax;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptClassifier {
    /// Concept activation vector: a linear separator.
    Cav,
    /// Concept activation region: an RBF kernel score.
    Car,
}

impl ConceptClassifier {
    pub fn label(self) -> &'static str {
        match self {
            ConceptClassifier::Cav => "CAV",
            ConceptClassifier::Car => "CAR",
        }
    }
}

#[derive(Debug, Clone)]
enum FittedConcept {
    Linear(Linear),
    Kernel {
        positives: Array2<f64>,
        negatives: Array2<f64>,
        gamma: f64,
    },
}

impl FittedConcept {
    fn contains(&self, h: &Array2<f64>) -> Result<Vec<bool>> {
        match self {
            FittedConcept::Linear(linear) => {
                let logits = linear.forward(h)?;
                Ok(logits.rows().into_iter().map(|r| argmax(r) == 1).collect())
            }
            FittedConcept::Kernel {
                positives,
                negatives,
                gamma,
            } => {
                if h.ncols() != positives.ncols() {
                    return Err(XaiError::shape(format!(
                        "concept fitted on {} features, got {}",
                        positives.ncols(),
                        h.ncols()
                    )));
                }
                Ok(h.rows()
                    .into_iter()
                    .map(|row| {
                        let density = |set: &Array2<f64>| {
                            set.rows()
                                .into_iter()
                                .map(|s| (-gamma * (&s - &row).mapv(|v| v * v).sum()).exp())
                                .sum::<f64>()
                                / set.nrows() as f64
                        };
                        density(positives) > density(negatives)
                    })
                    .collect())
            }
        }
    }
}

/// `gamma = 1 / (features · variance)` of the fitting set.
fn kernel_width(h: &Array2<f64>) -> f64 {
    let mean = h.mean().unwrap_or(0.0);
    let var = h.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
    if var <= f64::EPSILON {
        1.0
    } else {
        1.0 / (h.ncols() as f64 * var)
    }
}

pub struct ConceptExplainer<'m, M: Classifier + ?Sized> {
    model: &'m M,
    capture: ActivationCapture,
    kind: ConceptClassifier,
    batch_size: usize,
    epochs: usize,
    lr: f64,
    seed: u64,
    concepts: Vec<FittedConcept>,
}

impl<'m, M: Classifier + ?Sized> ConceptExplainer<'m, M> {
    pub fn new(model: &'m M, layer: &str, kind: ConceptClassifier, batch_size: usize) -> Result<Self> {
        Ok(Self {
            model,
            capture: ActivationCapture::attach(model, layer)?,
            kind,
            batch_size,
            epochs: 200,
            lr: 1e-2,
            seed: 0,
            concepts: Vec::new(),
        })
    }

    /// Optimisation settings for CAV fitting.
    pub fn with_training(mut self, epochs: usize, lr: f64, seed: u64) -> Self {
        self.epochs = epochs;
        self.lr = lr;
        self.seed = seed;
        self
    }

    pub fn num_concepts(&self) -> usize {
        self.concepts.len()
    }

    /// Positive and negative representations for concept `class`.
    fn concept_sets(
        &self,
        data: &Dataset,
        h: &Array2<f64>,
        class: usize,
        size: usize,
        rng: &mut StdRng,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let positive = data.class_indices(class);
        let negative: Vec<usize> = (0..data.len()).filter(|i| data.y[*i] != class).collect();
        if positive.is_empty() || negative.is_empty() {
            return Err(XaiError::dataset(format!(
                "concept {class} needs positive and negative examples"
            )));
        }
        let pick = |pool: &[usize], rng: &mut StdRng| -> Vec<usize> {
            rand::seq::index::sample(rng, pool.len(), size.min(pool.len()))
                .into_iter()
                .map(|i| pool[i])
                .collect()
        };
        let pos = pick(&positive, rng);
        let neg = pick(&negative, rng);
        Ok((h.select(Axis(0), &pos), h.select(Axis(0), &neg)))
    }

    /// Fit one concept classifier per class of `train`.
    pub fn fit(&mut self, train: &Dataset, concept_set_size: usize, rng: &mut StdRng) -> Result<()> {
        let h = capture_batched(&self.capture, self.model, &train.x, self.batch_size)?;
        let mut concepts = Vec::new();
        for class in 0..train.num_classes() {
            let (pos, neg) = self.concept_sets(train, &h, class, concept_set_size, rng)?;
            let fitted = match self.kind {
                ConceptClassifier::Cav => FittedConcept::Linear(self.fit_linear(&pos, &neg)?),
                ConceptClassifier::Car => {
                    let all = ndarray::concatenate(Axis(0), &[pos.view(), neg.view()])
                        .map_err(|e| XaiError::shape(e.to_string()))?;
                    FittedConcept::Kernel {
                        gamma: kernel_width(&all),
                        positives: pos,
                        negatives: neg,
                    }
                }
            };
            concepts.push(fitted);
        }
        tracing::info!(kind = self.kind.label(), concepts = concepts.len(), "fitted concept classifiers");
        self.concepts = concepts;
        Ok(())
    }

    fn fit_linear(&self, pos: &Array2<f64>, neg: &Array2<f64>) -> Result<Linear> {
        let features = ndarray::concatenate(Axis(0), &[pos.view(), neg.view()])
            .map_err(|e| XaiError::shape(e.to_string()))?;
        let labels: Vec<usize> = std::iter::repeat_n(1, pos.nrows())
            .chain(std::iter::repeat_n(0, neg.nrows()))
            .collect();
        let mut rng = <StdRng as rand::SeedableRng>::seed_from_u64(self.seed);
        let init = Linear::new(features.ncols(), 2, &mut rng);
        let mut params = vec![init.weight, init.bias.insert_axis(Axis(0))];
        let mut optimizer = Adam::default_params(self.lr);
        for _ in 0..self.epochs {
            let tape = Tape::new();
            let weight = tape.leaf(params[0].clone());
            let bias = tape.leaf(params[1].clone());
            let h = tape.constant(features.clone());
            let logits = &h.matmul(&weight.t()) + &bias.broadcast_rows(features.nrows());
            let loss = cross_entropy(&logits, &labels)?;
            let grads = tape.grad(&loss, &[weight, bias])?;
            optimizer.step(&mut params, &[grads[0].value(), grads[1].value()])?;
        }
        Ok(Linear {
            weight: params[0].clone(),
            bias: params[1].row(0).to_owned(),
        })
    }

    fn ensure_fitted(&self) -> Result<()> {
        if self.concepts.is_empty() {
            return Err(XaiError::invalid_input("concept explainer used before fit"));
        }
        Ok(())
    }

    /// Held-out accuracy of every concept classifier on fresh concept sets
    /// drawn from `test`.
    pub fn concept_accuracy(&self, test: &Dataset, concept_set_size: usize, rng: &mut StdRng) -> Result<Vec<f64>> {
        self.ensure_fitted()?;
        let h = capture_batched(&self.capture, self.model, &test.x, self.batch_size)?;
        let mut accuracies = Vec::with_capacity(self.concepts.len());
        for (class, concept) in self.concepts.iter().enumerate() {
            let (pos, neg) = self.concept_sets(test, &h, class, concept_set_size, rng)?;
            let hits = concept.contains(&pos)?.iter().filter(|&&c| c).count()
                + concept.contains(&neg)?.iter().filter(|&&c| !c).count();
            accuracies.push(hits as f64 / (pos.nrows() + neg.nrows()) as f64);
        }
        Ok(accuracies)
    }
}

impl<M: Classifier + ?Sized> Explainer for ConceptExplainer<'_, M> {
    fn name(&self) -> &str {
        self.kind.label()
    }

    /// Binary membership `(n, n_concepts)`.
    fn attribute(&mut self, x: &Array4<f64>, _y: &Array1<usize>) -> Result<Array2<f64>> {
        self.ensure_fitted()?;
        let h = self.capture.capture(self.model, x)?;
        let mut out = Array2::<f64>::zeros((h.nrows(), self.concepts.len()));
        for (c, concept) in self.concepts.iter().enumerate() {
            for (i, inside) in concept.contains(&h)?.into_iter().enumerate() {
                out[[i, c]] = if inside { 1.0 } else { 0.0 };
            }
        }
        Ok(out)
    }
}
