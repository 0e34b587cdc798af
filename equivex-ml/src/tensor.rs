//! Small array helpers shared by symmetries, hooks and explainers.
//!
//! Inputs are `(batch, channels, height, width)`; per-example quantities are
//! flattened to `(batch, features)` rows.

use ndarray::{Array1, Array2, Array4, ArrayView1, Axis};

use crate::error::{Result, XaiError};

/// Flatten every example of a 4-D batch into one row.
pub fn flatten_batch(x: &Array4<f64>) -> Array2<f64> {
    let n = x.len_of(Axis(0));
    let features = if n == 0 { 0 } else { x.len() / n };
    Array2::from_shape_vec((n, features), x.iter().copied().collect())
        .unwrap_or_else(|_| Array2::zeros((n, features)))
}

/// Cyclic shift of the spatial axes: `out[.., .., i, j] = x[.., .., i - dy, j - dx]`.
pub fn roll_spatial(x: &Array4<f64>, dy: isize, dx: isize) -> Array4<f64> {
    let (_, _, h, w) = x.dim();
    if h == 0 || w == 0 {
        return x.clone();
    }
    Array4::from_shape_fn(x.dim(), |(n, c, i, j)| {
        let si = (i as isize - dy).rem_euclid(h as isize) as usize;
        let sj = (j as isize - dx).rem_euclid(w as isize) as usize;
        x[[n, c, si, sj]]
    })
}

/// Rows `indices` of a batch.
pub fn select_examples(x: &Array4<f64>, indices: &[usize]) -> Array4<f64> {
    x.select(Axis(0), indices)
}

/// Entries `indices` of a label vector.
pub fn select_labels(y: &Array1<usize>, indices: &[usize]) -> Array1<usize> {
    indices.iter().map(|&i| y[i]).collect()
}

/// Cosine similarity with the denominator clamped at `eps`, so zero vectors
/// compare as 0 instead of NaN.
pub fn cosine(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    const EPS: f64 = 1e-8;
    let dot = a.dot(&b);
    let norm = (a.dot(&a).sqrt() * b.dot(&b).sqrt()).max(EPS);
    dot / norm
}

/// Pairwise cosine similarity of the rows of `a` `(n, d)` against the rows of
/// `b` `(m, d)`, giving `(n, m)`.
pub fn pairwise_cosine(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>> {
    if a.ncols() != b.ncols() {
        return Err(XaiError::shape(format!(
            "cosine similarity over {} and {} features",
            a.ncols(),
            b.ncols()
        )));
    }
    Ok(Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        cosine(a.row(i), b.row(j))
    }))
}

/// Index of the largest entry of a row; ties resolve to the first.
pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}
