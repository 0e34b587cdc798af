//! The dihedral group D4 of the square: quarter turns and reflections.

use ndarray::Array4;

use super::{Shape, SymmetryGroup};
use crate::error::{Result, XaiError};

/// Reflect (optionally) across the vertical axis, then rotate by
/// `quarter_turns × 90°` counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DihedralElement {
    pub quarter_turns: u8,
    pub reflect: bool,
}

impl DihedralElement {
    pub const IDENTITY: DihedralElement = DihedralElement {
        quarter_turns: 0,
        reflect: false,
    };
}

/// D4, 8 elements, acting on square images.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dihedral;

fn rotate_once(x: &Array4<f64>) -> Array4<f64> {
    let (_, _, _, w) = x.dim();
    Array4::from_shape_fn(x.dim(), |(n, c, i, j)| x[[n, c, j, w - 1 - i]])
}

fn reflect(x: &Array4<f64>) -> Array4<f64> {
    let (_, _, _, w) = x.dim();
    Array4::from_shape_fn(x.dim(), |(n, c, i, j)| x[[n, c, i, w - 1 - j]])
}

impl SymmetryGroup for Dihedral {
    type Element = DihedralElement;

    fn name(&self) -> &str {
        "dihedral-d4"
    }

    fn elements(&self, _shape: Shape) -> Result<Vec<DihedralElement>> {
        Ok([false, true]
            .into_iter()
            .flat_map(|reflect| {
                (0..4).map(move |quarter_turns| DihedralElement {
                    quarter_turns,
                    reflect,
                })
            })
            .collect())
    }

    fn apply(&self, x: &Array4<f64>, element: &DihedralElement) -> Result<Array4<f64>> {
        let (_, _, h, w) = x.dim();
        if h != w {
            return Err(XaiError::symmetry(format!(
                "dihedral group needs square inputs, got {h}x{w}"
            )));
        }
        let mut out = if element.reflect { reflect(x) } else { x.clone() };
        for _ in 0..element.quarter_turns % 4 {
            out = rotate_once(&out);
        }
        Ok(out)
    }

    fn identity(&self) -> Option<DihedralElement> {
        Some(DihedralElement::IDENTITY)
    }

    fn is_exact(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> Array4<f64> {
        Array4::from_shape_fn((1, 2, 3, 3), |(_, c, i, j)| (c * 9 + i * 3 + j) as f64)
    }

    #[test]
    fn test_has_eight_distinct_actions() {
        let group = Dihedral;
        let x = image();
        let mut images = Vec::new();
        for e in group.elements((1, 2, 3, 3)).unwrap() {
            let y = group.apply(&x, &e).unwrap();
            assert!(!images.contains(&y));
            images.push(y);
        }
        assert_eq!(images.len(), 8);
    }

    #[test]
    fn test_four_turns_is_identity() {
        let x = image();
        let once = DihedralElement {
            quarter_turns: 1,
            reflect: false,
        };
        let mut y = x.clone();
        for _ in 0..4 {
            y = Dihedral.apply(&y, &once).unwrap();
        }
        assert_eq!(y, x);
    }

    #[test]
    fn test_reflection_is_involution() {
        let x = image();
        let flip = DihedralElement {
            quarter_turns: 0,
            reflect: true,
        };
        let twice = Dihedral
            .apply(&Dihedral.apply(&x, &flip).unwrap(), &flip)
            .unwrap();
        assert_eq!(twice, x);
    }

    #[test]
    fn test_rejects_non_square() {
        let x = Array4::<f64>::zeros((1, 1, 2, 3));
        assert!(Dihedral.apply(&x, &DihedralElement::IDENTITY).is_err());
    }
}
