//! Symmetry groups acting on input batches.
//!
//! A group is a stateless description of a set of invertible transformations.
//! Exact groups ([`Dihedral`], full-range [`Translation1D`] / [`Translation2D`])
//! are closed under composition; windowed and anchored translations compose
//! only approximately.

pub mod dihedral;
pub mod translation;

pub use dihedral::{Dihedral, DihedralElement};
pub use translation::{AnchoredTranslation2D, Shift2D, Translation1D, Translation2D};

use ndarray::Array4;
use rand::rngs::StdRng;
use rand::seq::index;
use std::fmt::Debug;

use crate::error::{Result, XaiError};

/// Input shape `(batch, channels, height, width)`.
pub type Shape = (usize, usize, usize, usize);

/// A finite or parametrised set of transformations of an input batch.
pub trait SymmetryGroup {
    type Element: Clone + Debug + PartialEq;

    fn name(&self) -> &str;

    /// Every element, in a deterministic order.
    fn elements(&self, shape: Shape) -> Result<Vec<Self::Element>>;

    /// Transform every example of `x` by `element`.
    fn apply(&self, x: &Array4<f64>, element: &Self::Element) -> Result<Array4<f64>>;

    /// Transform `target` the way `apply` would transform `reference`.
    ///
    /// Used to move maps that live in input space (feature attributions)
    /// alongside their input. Groups whose action depends on the input
    /// content read it from `reference`; `target` must have the same shape.
    fn apply_like(
        &self,
        reference: &Array4<f64>,
        target: &Array4<f64>,
        element: &Self::Element,
    ) -> Result<Array4<f64>> {
        if reference.dim() != target.dim() {
            return Err(XaiError::shape(format!(
                "reference {:?} and target {:?} differ in shape",
                reference.dim(),
                target.dim()
            )));
        }
        self.apply(target, element)
    }

    /// The neutral element, if the group has one that leaves inputs untouched.
    fn identity(&self) -> Option<Self::Element>;

    /// Whether composition stays inside the set for every input.
    fn is_exact(&self) -> bool;

    fn order(&self, shape: Shape) -> Result<usize> {
        Ok(self.elements(shape)?.len())
    }

    /// `n` distinct elements drawn uniformly. Asking for at least the group
    /// order returns the full enumeration.
    fn sample(&self, shape: Shape, n: usize, rng: &mut StdRng) -> Result<Vec<Self::Element>> {
        let all = self.elements(shape)?;
        if n >= all.len() {
            return Ok(all);
        }
        let picked = index::sample(rng, all.len(), n);
        Ok(picked.iter().map(|i| all[i].clone()).collect())
    }

    /// Like [`SymmetryGroup::sample`], but the identity is always the first
    /// element and the remaining `n - 1` are drawn from the other elements.
    /// Fails for groups without an identity; see [`sample_identity_first`].
    fn sample_with_identity(
        &self,
        shape: Shape,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<Self::Element>> {
        let identity = self.identity().ok_or_else(|| {
            XaiError::symmetry(format!("group {} has no identity element", self.name()))
        })?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let others: Vec<_> = self
            .elements(shape)?
            .into_iter()
            .filter(|e| *e != identity)
            .collect();
        let take = (n - 1).min(others.len());
        let mut picked = vec![identity];
        picked.extend(
            index::sample(rng, others.len(), take)
                .iter()
                .map(|i| others[i].clone()),
        );
        Ok(picked)
    }
}

/// Identity-first sampling when the group has an identity, plain sampling
/// otherwise.
pub fn sample_identity_first<G: SymmetryGroup + ?Sized>(
    group: &G,
    shape: Shape,
    n: usize,
    rng: &mut StdRng,
) -> Result<Vec<G::Element>> {
    match group.identity() {
        Some(_) => group.sample_with_identity(shape, n, rng),
        None => group.sample(shape, n, rng),
    }
}
