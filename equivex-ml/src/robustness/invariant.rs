//! Make any explainer approximately invariant by averaging it over group
//! orbits.

use ndarray::{Array1, Array2, Array4};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, XaiError};
use crate::explain::Explainer;
use crate::symmetry::{SymmetryGroup, sample_identity_first};

/// How the explanations of the transformed copies are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    /// Mean membership thresholded at ½, for concept explainers.
    MajorityVote,
}

/// Wraps an explainer with a group and a sample count `n_inv`.
///
/// Each query explains `n_inv` transformed copies of the input and combines
/// the results. When `n_inv` reaches the group order the whole group is
/// enumerated and the output is exactly invariant for exact groups.
pub struct InvariantExplainer<E, G: SymmetryGroup> {
    explainer: E,
    group: G,
    n_inv: usize,
    aggregation: Aggregation,
    include_identity: bool,
    rng: StdRng,
    name: String,
}

impl<E: Explainer, G: SymmetryGroup> InvariantExplainer<E, G> {
    pub fn new(explainer: E, group: G, n_inv: usize) -> Self {
        let name = format!("{}-Inv", explainer.name());
        Self {
            explainer,
            group,
            n_inv,
            aggregation: Aggregation::Mean,
            include_identity: true,
            rng: StdRng::seed_from_u64(0),
            name,
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Whether sampled subsets always contain the identity (default `true`).
    /// Ignored for groups without an identity element.
    pub fn with_identity(mut self, include_identity: bool) -> Self {
        self.include_identity = include_identity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn n_inv(&self) -> usize {
        self.n_inv
    }

    pub fn inner(&self) -> &E {
        &self.explainer
    }

    pub fn into_inner(self) -> E {
        self.explainer
    }

    fn elements(&mut self, x: &Array4<f64>) -> Result<Vec<G::Element>> {
        if self.n_inv == 0 {
            return Err(XaiError::invalid_input("invariant explainer needs n_inv >= 1"));
        }
        let shape = x.dim();
        if self.n_inv >= self.group.order(shape)? {
            return self.group.elements(shape);
        }
        if self.include_identity {
            sample_identity_first(&self.group, shape, self.n_inv, &mut self.rng)
        } else {
            self.group.sample(shape, self.n_inv, &mut self.rng)
        }
    }
}

impl<E: Explainer, G: SymmetryGroup> Explainer for InvariantExplainer<E, G> {
    fn name(&self) -> &str {
        &self.name
    }

    fn attribute(&mut self, x: &Array4<f64>, y: &Array1<usize>) -> Result<Array2<f64>> {
        let elements = self.elements(x)?;
        tracing::debug!(explainer = %self.name, elements = elements.len(), "explaining transformed copies");
        let mut total: Option<Array2<f64>> = None;
        for element in &elements {
            let scores = self.explainer.attribute(&self.group.apply(x, element)?, y)?;
            total = Some(match total {
                None => scores,
                Some(acc) if acc.dim() == scores.dim() => acc + &scores,
                Some(acc) => {
                    return Err(XaiError::shape(format!(
                        "wrapped explainer returned {:?} then {:?}",
                        acc.dim(),
                        scores.dim()
                    )));
                }
            });
        }
        let mut mean = total.ok_or_else(|| XaiError::symmetry("no group elements to average over"))?;
        if elements.len() > 1 {
            mean /= elements.len() as f64;
        }
        Ok(match self.aggregation {
            Aggregation::Mean => mean,
            Aggregation::MajorityVote => mean.mapv(|m| if m >= 0.5 { 1.0 } else { 0.0 }),
        })
    }
}
