//! Row-wise comparators for predictions and explanations.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Result, XaiError};
use crate::tensor::{argmax, cosine};

const ZERO_TOL: f64 = 1e-12;

/// How two outputs of the same example are compared. Every variant scores
/// identical rows as 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    /// Cosine of the two rows; two zero rows count as identical.
    #[default]
    Cosine,
    /// Fraction of entries on the same side of ½. Suited to binary concept
    /// memberships and their averages.
    Accuracy,
    /// 1 when both rows have the same argmax, else 0.
    ArgmaxAgreement,
    /// Pearson correlation of the two rows; two constant rows count as
    /// identical when equal.
    Pearson,
}

impl Similarity {
    pub fn label(self) -> &'static str {
        match self {
            Similarity::Cosine => "cosine",
            Similarity::Accuracy => "accuracy",
            Similarity::ArgmaxAgreement => "argmax_agreement",
            Similarity::Pearson => "pearson",
        }
    }

    /// Lowest and highest attainable score.
    pub fn range(self) -> (f64, f64) {
        match self {
            Similarity::Cosine | Similarity::Pearson => (-1.0, 1.0),
            Similarity::Accuracy | Similarity::ArgmaxAgreement => (0.0, 1.0),
        }
    }

    /// One score per row of `a` and `b`.
    pub fn compare(self, a: &Array2<f64>, b: &Array2<f64>) -> Result<Array1<f64>> {
        if a.dim() != b.dim() {
            return Err(XaiError::shape(format!(
                "cannot compare outputs of shape {:?} and {:?}",
                a.dim(),
                b.dim()
            )));
        }
        Ok(a.rows()
            .into_iter()
            .zip(b.rows())
            .map(|(ra, rb)| self.compare_rows(ra, rb))
            .collect())
    }

    fn compare_rows(self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match self {
            Similarity::Cosine => {
                if a.dot(&a) <= ZERO_TOL && b.dot(&b) <= ZERO_TOL {
                    1.0
                } else {
                    cosine(a, b)
                }
            }
            Similarity::Accuracy => {
                if a.is_empty() {
                    return 1.0;
                }
                let agree = a.iter().zip(b.iter()).filter(|&(&x, &y)| (x >= 0.5) == (y >= 0.5)).count();
                agree as f64 / a.len() as f64
            }
            Similarity::ArgmaxAgreement => {
                if argmax(a) == argmax(b) {
                    1.0
                } else {
                    0.0
                }
            }
            Similarity::Pearson => match pearson(a, b) {
                Some(r) => r,
                None if a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= ZERO_TOL) => 1.0,
                None => 0.0,
            },
        }
    }
}

impl std::fmt::Display for Similarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Pearson correlation, `None` when either side has no variance.
pub(crate) fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let n = a.len();
    if n < 2 || b.len() != n {
        return None;
    }
    let mean_a = a.sum() / n as f64;
    let mean_b = b.sum() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= ZERO_TOL || var_b <= ZERO_TOL {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}
