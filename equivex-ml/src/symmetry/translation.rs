//! Cyclic translations of signals and images.

use std::collections::HashSet;

use ndarray::{Array4, Axis};
use rand::Rng;
use rand::rngs::StdRng;

use super::{Shape, SymmetryGroup};
use crate::error::{Result, XaiError};
use crate::tensor::roll_spatial;

/// Cyclic shifts of a 1-D signal along the width axis.
///
/// With `n_steps = None` every shift of the signal is an element, which makes
/// the set the exact cyclic group of the signal length.
#[derive(Debug, Clone, Default)]
pub struct Translation1D {
    n_steps: Option<usize>,
}

impl Translation1D {
    pub fn new(n_steps: Option<usize>) -> Self {
        Self { n_steps }
    }
}

impl SymmetryGroup for Translation1D {
    type Element = isize;

    fn name(&self) -> &str {
        "translation-1d"
    }

    fn elements(&self, shape: Shape) -> Result<Vec<isize>> {
        let length = shape.3;
        if length == 0 {
            return Err(XaiError::symmetry("cannot translate an empty signal"));
        }
        let steps = self.n_steps.unwrap_or(length);
        if steps > length {
            return Err(XaiError::symmetry(format!(
                "{steps} translation steps exceed signal length {length}"
            )));
        }
        Ok((0..steps as isize).collect())
    }

    fn apply(&self, x: &Array4<f64>, shift: &isize) -> Result<Array4<f64>> {
        Ok(roll_spatial(x, 0, *shift))
    }

    fn identity(&self) -> Option<isize> {
        Some(0)
    }

    fn is_exact(&self) -> bool {
        self.n_steps.is_none()
    }
}

/// A 2-D displacement `(dy, dx)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shift2D {
    pub dy: isize,
    pub dx: isize,
}

impl Shift2D {
    pub const ZERO: Shift2D = Shift2D { dy: 0, dx: 0 };

    pub fn new(dy: isize, dx: isize) -> Self {
        Self { dy, dx }
    }
}

/// Cyclic shifts of an image.
///
/// `max_displacement = None` enumerates the full torus of shifts (exact
/// group); `Some(m)` restricts to the window `[-m, m]²`.
#[derive(Debug, Clone, Default)]
pub struct Translation2D {
    max_displacement: Option<usize>,
}

impl Translation2D {
    pub fn new(max_displacement: Option<usize>) -> Self {
        Self { max_displacement }
    }

    fn ranges(&self, shape: Shape) -> Result<(Vec<isize>, Vec<isize>)> {
        let (_, _, h, w) = shape;
        if h == 0 || w == 0 {
            return Err(XaiError::symmetry("cannot translate an empty image"));
        }
        Ok(match self.max_displacement {
            None => ((0..h as isize).collect(), (0..w as isize).collect()),
            Some(m) => {
                if 2 * m + 1 > h.min(w) {
                    return Err(XaiError::symmetry(format!(
                        "displacement window [-{m}, {m}] aliases on a {h}x{w} image"
                    )));
                }
                let m = m as isize;
                ((-m..=m).collect(), (-m..=m).collect())
            }
        })
    }
}

impl SymmetryGroup for Translation2D {
    type Element = Shift2D;

    fn name(&self) -> &str {
        "translation-2d"
    }

    fn elements(&self, shape: Shape) -> Result<Vec<Shift2D>> {
        let (ys, xs) = self.ranges(shape)?;
        Ok(ys
            .iter()
            .flat_map(|&dy| xs.iter().map(move |&dx| Shift2D::new(dy, dx)))
            .collect())
    }

    fn apply(&self, x: &Array4<f64>, shift: &Shift2D) -> Result<Array4<f64>> {
        Ok(roll_spatial(x, shift.dy, shift.dx))
    }

    fn identity(&self) -> Option<Shift2D> {
        Some(Shift2D::ZERO)
    }

    fn is_exact(&self) -> bool {
        self.max_displacement.is_none()
    }

    fn order(&self, shape: Shape) -> Result<usize> {
        let (ys, xs) = self.ranges(shape)?;
        Ok(ys.len() * xs.len())
    }

    /// Draws displacements directly from the parameter ranges, so large
    /// groups are never enumerated.
    fn sample(&self, shape: Shape, n: usize, rng: &mut StdRng) -> Result<Vec<Shift2D>> {
        let order = self.order(shape)?;
        if n >= order {
            return self.elements(shape);
        }
        let (ys, xs) = self.ranges(shape)?;
        let mut seen = HashSet::with_capacity(n);
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            let shift = Shift2D::new(
                ys[rng.gen_range(0..ys.len())],
                xs[rng.gen_range(0..xs.len())],
            );
            if seen.insert(shift) {
                picked.push(shift);
            }
        }
        Ok(picked)
    }
}

/// Translations anchored to the content of each example.
///
/// Element `(dy, dx)` moves the centre of the example's content bounding box
/// (entries with `|v| > threshold`, summed over channels) to the image centre
/// plus `(dy, dx)`. Applying an element to an already translated input gives
/// the same result as applying it to the original, as long as the content did
/// not wrap around the border. That makes the orbit of every input the same
/// set, which is what invariance enforcement needs.
#[derive(Debug, Clone)]
pub struct AnchoredTranslation2D {
    max_displacement: usize,
    threshold: f64,
}

impl AnchoredTranslation2D {
    pub fn new(max_displacement: usize) -> Self {
        Self {
            max_displacement,
            threshold: 0.0,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Offset of each example's content centre from the image centre.
    pub fn anchor_offsets(&self, x: &Array4<f64>) -> Vec<(isize, isize)> {
        let (_, _, h, w) = x.dim();
        x.axis_iter(Axis(0))
            .map(|example| {
                let mut rows = (usize::MAX, 0usize);
                let mut cols = (usize::MAX, 0usize);
                for i in 0..h {
                    for j in 0..w {
                        let mass: f64 = (0..example.len_of(Axis(0)))
                            .map(|c| example[[c, i, j]].abs())
                            .sum();
                        if mass > self.threshold {
                            rows = (rows.0.min(i), rows.1.max(i));
                            cols = (cols.0.min(j), cols.1.max(j));
                        }
                    }
                }
                if rows.0 == usize::MAX {
                    return (0, 0);
                }
                let cy = ((rows.0 + rows.1) / 2) as isize - (h / 2) as isize;
                let cx = ((cols.0 + cols.1) / 2) as isize - (w / 2) as isize;
                (cy, cx)
            })
            .collect()
    }
}

impl SymmetryGroup for AnchoredTranslation2D {
    type Element = Shift2D;

    fn name(&self) -> &str {
        "anchored-translation-2d"
    }

    fn elements(&self, shape: Shape) -> Result<Vec<Shift2D>> {
        Translation2D::new(Some(self.max_displacement)).elements(shape)
    }

    fn apply(&self, x: &Array4<f64>, shift: &Shift2D) -> Result<Array4<f64>> {
        self.apply_like(x, x, shift)
    }

    /// Moves `target` by the per-example displacement that `apply` would use
    /// on `reference`, so anchors come from the input and not from the map.
    fn apply_like(&self, reference: &Array4<f64>, target: &Array4<f64>, shift: &Shift2D) -> Result<Array4<f64>> {
        if reference.dim() != target.dim() {
            return Err(XaiError::shape(format!(
                "reference {:?} and target {:?} differ in shape",
                reference.dim(),
                target.dim()
            )));
        }
        let (_, _, h, w) = target.dim();
        if h == 0 || w == 0 {
            return Err(XaiError::symmetry("cannot translate an empty image"));
        }
        let offsets = self.anchor_offsets(reference);
        Ok(Array4::from_shape_fn(target.dim(), |(n, c, i, j)| {
            let (oy, ox) = offsets[n];
            let dy = shift.dy - oy;
            let dx = shift.dx - ox;
            let si = (i as isize - dy).rem_euclid(h as isize) as usize;
            let sj = (j as isize - dx).rem_euclid(w as isize) as usize;
            target[[n, c, si, sj]]
        }))
    }

    fn identity(&self) -> Option<Shift2D> {
        None
    }

    fn is_exact(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn blob(h: usize, w: usize, top: usize, left: usize) -> Array4<f64> {
        Array4::from_shape_fn((1, 1, h, w), |(_, _, i, j)| {
            if (top..top + 2).contains(&i) && (left..left + 3).contains(&j) {
                1.0 + (i + j) as f64
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_translation1d_full_group() {
        let group = Translation1D::new(None);
        let elements = group.elements((1, 1, 1, 6)).unwrap();
        assert_eq!(elements, vec![0, 1, 2, 3, 4, 5]);
        assert!(group.is_exact());
    }

    #[test]
    fn test_translation1d_closure() {
        let group = Translation1D::new(None);
        let x = Array4::from_shape_fn((1, 1, 1, 5), |(_, _, _, j)| j as f64);
        let twice = group.apply(&group.apply(&x, &3).unwrap(), &4).unwrap();
        let once = group.apply(&x, &((3 + 4) % 5)).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn test_translation1d_rejects_too_many_steps() {
        assert!(Translation1D::new(Some(10)).elements((1, 1, 1, 4)).is_err());
    }

    #[test]
    fn test_translation2d_window_order() {
        let group = Translation2D::new(Some(2));
        assert_eq!(group.order((1, 1, 8, 8)).unwrap(), 25);
        assert!(!group.is_exact());
        assert!(group.elements((1, 1, 8, 8)).unwrap().contains(&Shift2D::ZERO));
    }

    #[test]
    fn test_translation2d_rejects_aliasing_window() {
        assert!(Translation2D::new(Some(3)).elements((1, 1, 6, 8)).is_err());
        assert!(Translation2D::new(Some(2)).order((1, 1, 5, 5)).is_ok());
        assert!(AnchoredTranslation2D::new(4).elements((1, 1, 8, 8)).is_err());
    }

    #[test]
    fn test_anchored_apply_like_uses_input_anchor() {
        let group = AnchoredTranslation2D::new(2);
        let x = blob(10, 10, 1, 6);
        // Map whose content sits elsewhere than the input's.
        let map = roll_spatial(&x, 3, -4);
        for element in group.elements((1, 1, 10, 10)).unwrap() {
            let moved_x = group.apply(&x, &element).unwrap();
            let moved_map = group.apply_like(&x, &map, &element).unwrap();
            assert_eq!(moved_map, roll_spatial(&moved_x, 3, -4));
        }
    }

    #[test]
    fn test_translation2d_sample_stays_in_window() {
        use rand::SeedableRng;
        let group = Translation2D::new(Some(3));
        let mut rng = StdRng::seed_from_u64(5);
        let picked = group.sample((1, 1, 10, 10), 12, &mut rng).unwrap();
        assert_eq!(picked.len(), 12);
        assert!(picked.iter().all(|s| s.dy.abs() <= 3 && s.dx.abs() <= 3));
    }

    #[test]
    fn test_anchored_translation_orbit_ignores_prior_shift() {
        let group = AnchoredTranslation2D::new(2);
        let x = blob(10, 10, 3, 3);
        let shifted = roll_spatial(&x, 1, -2);
        for element in group.elements((1, 1, 10, 10)).unwrap() {
            assert_eq!(
                group.apply(&x, &element).unwrap(),
                group.apply(&shifted, &element).unwrap()
            );
        }
    }

    #[test]
    fn test_anchored_translation_composes_to_last() {
        let group = AnchoredTranslation2D::new(2);
        let x = blob(10, 10, 4, 2);
        let p = Shift2D::new(1, -1);
        let q = Shift2D::new(-2, 2);
        let composed = group.apply(&group.apply(&x, &q).unwrap(), &p).unwrap();
        assert_eq!(composed, group.apply(&x, &p).unwrap());
    }

    #[test]
    fn test_anchored_translation_empty_input_is_plain_shift() {
        let group = AnchoredTranslation2D::new(1);
        let x = Array4::<f64>::zeros((1, 1, 4, 4));
        assert_eq!(group.anchor_offsets(&x), vec![(0, 0)]);
        assert_eq!(group.apply(&x, &Shift2D::new(1, 1)).unwrap(), x);
    }
}
