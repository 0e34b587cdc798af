//! Property-based tests for the group laws of the exact symmetries.

use ndarray::Array4;
use proptest::prelude::*;

use equivex_ml::symmetry::{Dihedral, DihedralElement, Shift2D, SymmetryGroup, Translation1D, Translation2D};

fn signal(values: Vec<f64>) -> Array4<f64> {
    let n = values.len();
    Array4::from_shape_vec((1, 1, 1, n), values).unwrap()
}

fn square(values: Vec<f64>, side: usize) -> Array4<f64> {
    Array4::from_shape_vec((1, 1, side, side), values).unwrap()
}

fn image_strategy() -> impl Strategy<Value = (usize, Vec<f64>)> {
    (2usize..6).prop_flat_map(|side| (Just(side), prop::collection::vec(-10.0f64..10.0, side * side)))
}

// --- Cyclic translations ---

proptest! {
    #[test]
    fn translation1d_composes_by_addition(
        values in prop::collection::vec(-10.0f64..10.0, 2..16),
        a in 0isize..32,
        b in 0isize..32,
    ) {
        let group = Translation1D::new(None);
        let x = signal(values);
        let twice = group.apply(&group.apply(&x, &a).unwrap(), &b).unwrap();
        prop_assert_eq!(twice, group.apply(&x, &(a + b)).unwrap());
    }

    #[test]
    fn translation1d_inverse_restores_input(
        values in prop::collection::vec(-10.0f64..10.0, 2..16),
        shift in 0isize..16,
    ) {
        let group = Translation1D::new(None);
        let x = signal(values);
        let length = x.dim().3 as isize;
        let back = group.apply(&group.apply(&x, &shift).unwrap(), &(length - shift)).unwrap();
        prop_assert_eq!(back, x);
    }

    #[test]
    fn translation1d_full_group_has_signal_length_elements(length in 1usize..64) {
        let group = Translation1D::new(None);
        prop_assert_eq!(group.order((1, 1, 1, length)).unwrap(), length);
    }

    #[test]
    fn translation2d_composes_by_addition(
        (side, values) in image_strategy(),
        (ay, ax, by, bx) in (-4isize..4, -4isize..4, -4isize..4, -4isize..4),
    ) {
        let group = Translation2D::new(None);
        let x = square(values, side);
        let twice = group
            .apply(&group.apply(&x, &Shift2D::new(ay, ax)).unwrap(), &Shift2D::new(by, bx))
            .unwrap();
        prop_assert_eq!(twice, group.apply(&x, &Shift2D::new(ay + by, ax + bx)).unwrap());
    }
}

// --- Dihedral group ---

proptest! {
    #[test]
    fn dihedral_is_closed_under_composition(
        (side, values) in image_strategy(),
        i in 0usize..8,
        j in 0usize..8,
    ) {
        let group = Dihedral;
        let x = square(values, side);
        let elements = group.elements(x.dim()).unwrap();
        let composed = group.apply(&group.apply(&x, &elements[i]).unwrap(), &elements[j]).unwrap();
        let images: Vec<_> = elements.iter().map(|g| group.apply(&x, g).unwrap()).collect();
        prop_assert!(images.contains(&composed));
    }

    #[test]
    fn dihedral_elements_are_invertible(
        (side, values) in image_strategy(),
        i in 0usize..8,
    ) {
        let group = Dihedral;
        let x = square(values, side);
        let elements = group.elements(x.dim()).unwrap();
        let moved = group.apply(&x, &elements[i]).unwrap();
        let restored = elements
            .iter()
            .any(|g| group.apply(&moved, g).unwrap() == x);
        prop_assert!(restored);
    }

    #[test]
    fn dihedral_four_quarter_turns_is_identity((side, values) in image_strategy()) {
        let group = Dihedral;
        let x = square(values, side);
        let quarter = DihedralElement { quarter_turns: 1, reflect: false };
        let mut out = x.clone();
        for _ in 0..4 {
            out = group.apply(&out, &quarter).unwrap();
        }
        prop_assert_eq!(out, x);
    }
}
