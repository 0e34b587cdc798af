//! Labelled input batches, sampling and loaders.

use std::path::Path;

use ndarray::{Array1, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, XaiError};
use crate::persistence::Fingerprint;
use crate::symmetry::Shape;
use crate::tensor::{select_examples, select_labels};

/// Inputs `(n, channels, height, width)` with one class label per example.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub x: Array4<f64>,
    pub y: Array1<usize>,
}

impl Dataset {
    pub fn new(x: Array4<f64>, y: Array1<usize>) -> Result<Self> {
        if x.len_of(Axis(0)) != y.len() {
            return Err(XaiError::dataset(format!(
                "{} inputs but {} labels",
                x.len_of(Axis(0)),
                y.len()
            )));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn shape(&self) -> Shape {
        self.x.dim()
    }

    /// One more than the largest label.
    pub fn num_classes(&self) -> usize {
        self.y.iter().max().map_or(0, |&m| m + 1)
    }

    pub fn subset(&self, indices: &[usize]) -> Result<Dataset> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(XaiError::dataset(format!(
                "index {bad} out of range for {} examples",
                self.len()
            )));
        }
        Ok(Dataset {
            x: select_examples(&self.x, indices),
            y: select_labels(&self.y, indices),
        })
    }

    /// The first `n` examples (or all of them).
    pub fn head(&self, n: usize) -> Dataset {
        let indices: Vec<usize> = (0..n.min(self.len())).collect();
        Dataset {
            x: select_examples(&self.x, &indices),
            y: select_labels(&self.y, &indices),
        }
    }

    /// `n` examples drawn without replacement.
    pub fn random_subset(&self, n: usize, rng: &mut StdRng) -> Dataset {
        let picked = rand::seq::index::sample(rng, self.len(), n.min(self.len())).into_vec();
        Dataset {
            x: select_examples(&self.x, &picked),
            y: select_labels(&self.y, &picked),
        }
    }

    /// Feed the shape, inputs and labels into `fp`.
    pub fn fingerprint(&self, fp: &mut Fingerprint) {
        let (n, c, h, w) = self.shape();
        for d in [n, c, h, w] {
            fp.update_u64(d as u64);
        }
        fp.update_floats(self.x.iter());
        for &label in &self.y {
            fp.update_u64(label as u64);
        }
    }

    pub fn class_indices(&self, class: usize) -> Vec<usize> {
        self.y
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label == class)
            .map(|(i, _)| i)
            .collect()
    }

    /// Consecutive batches of at most `batch_size` examples, in order.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Dataset> + '_ {
        let size = batch_size.max(1);
        (0..self.len()).step_by(size).map(move |start| {
            let indices: Vec<usize> = (start..(start + size).min(self.len())).collect();
            Dataset {
                x: select_examples(&self.x, &indices),
                y: select_labels(&self.y, &indices),
            }
        })
    }

    /// Load 1-D signals from a CSV file: one example per row, samples first,
    /// the class label in the last column. A non-numeric first row is treated
    /// as a header. With `binarize`, every label `>= 1` becomes 1.
    pub fn from_signal_csv(path: &Path, binarize: bool) -> Result<Dataset> {
        let text = std::fs::read_to_string(path)?;
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: std::result::Result<Vec<f64>, _> =
                line.split(',').map(|v| v.trim().parse::<f64>()).collect();
            match parsed {
                Ok(values) => rows.push(values),
                Err(_) if line_no == 0 => continue,
                Err(e) => {
                    return Err(XaiError::dataset(format!(
                        "{}:{}: {e}",
                        path.display(),
                        line_no + 1
                    )));
                }
            }
        }
        let width = rows.first().map_or(0, Vec::len);
        if width < 2 {
            return Err(XaiError::dataset(format!(
                "{} has no signal columns",
                path.display()
            )));
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            return Err(XaiError::dataset(format!(
                "{}: row {} has {} columns, expected {width}",
                path.display(),
                bad + 1,
                rows[bad].len()
            )));
        }

        let length = width - 1;
        let n = rows.len();
        let x = Array4::from_shape_fn((n, 1, 1, length), |(i, _, _, j)| rows[i][j]);
        let y = rows
            .iter()
            .map(|r| {
                let label = r[length].max(0.0).round() as usize;
                if binarize { label.min(1) } else { label }
            })
            .collect();
        tracing::info!(path = %path.display(), examples = n, length, "loaded signal dataset");
        Dataset::new(x, y)
    }
}

/// Seeded index sampler drawing with replacement. Successive calls keep
/// advancing the same stream.
pub struct ReplacementSampler {
    rng: StdRng,
    population: usize,
}

impl ReplacementSampler {
    pub fn new(population: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            population,
        }
    }

    pub fn next_batch(&mut self, size: usize) -> Result<Vec<usize>> {
        if self.population == 0 {
            return Err(XaiError::dataset("cannot sample from an empty dataset"));
        }
        Ok((0..size)
            .map(|_| self.rng.gen_range(0..self.population))
            .collect())
    }
}

/// Generators of small labelled datasets whose classes are defined by a
/// pattern that may appear anywhere in the input.
pub mod synthetic {
    use super::*;

    /// 1-D signals of `length` samples. Class `c` is a bump of width `c + 2`
    /// placed at a random cyclic offset, plus uniform noise in `[-noise, noise]`.
    pub fn shifted_patterns(
        n: usize,
        classes: usize,
        length: usize,
        noise: f64,
        seed: u64,
    ) -> Result<Dataset> {
        if classes == 0 || length < classes + 2 {
            return Err(XaiError::dataset(format!(
                "cannot place {classes} patterns in signals of length {length}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Array4::zeros((n, 1, 1, length));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let class = i % classes;
            let offset = rng.gen_range(0..length);
            for k in 0..class + 2 {
                x[[i, 0, 0, (offset + k) % length]] = 1.0;
            }
            for j in 0..length {
                x[[i, 0, 0, j]] += noise * rng.gen_range(-1.0_f64..=1.0);
            }
            y[i] = class;
        }
        Dataset::new(x, y)
    }

    /// Square images of side `size`. Class `c` is a filled square of side
    /// `c + 1` placed at a random position away from the border.
    pub fn shifted_squares(n: usize, classes: usize, size: usize, seed: u64) -> Result<Dataset> {
        if classes == 0 || size < classes + 2 {
            return Err(XaiError::dataset(format!(
                "cannot place {classes} squares in {size}x{size} images"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Array4::zeros((n, 1, size, size));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let class = i % classes;
            let side = class + 1;
            let top = rng.gen_range(1..size - side);
            let left = rng.gen_range(1..size - side);
            for a in 0..side {
                for b in 0..side {
                    x[[i, 0, top + a, left + b]] = 1.0;
                }
            }
            y[i] = class;
        }
        Dataset::new(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toy() -> Dataset {
        synthetic::shifted_patterns(10, 2, 8, 0.0, 3).unwrap()
    }

    #[test]
    fn test_batches_cover_dataset_in_order() {
        let data = toy();
        let sizes: Vec<usize> = data.batches(4).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        let first = data.batches(4).next().unwrap();
        assert_eq!(first.y, data.head(4).y);
    }

    #[test]
    fn test_subset_rejects_bad_index() {
        assert!(toy().subset(&[0, 10]).is_err());
    }

    #[test]
    fn test_class_indices() {
        let data = toy();
        assert_eq!(data.class_indices(1), vec![1, 3, 5, 7, 9]);
        assert_eq!(data.num_classes(), 2);
    }

    #[test]
    fn test_sampler_is_seeded_and_in_range() {
        let mut a = ReplacementSampler::new(5, 9);
        let mut b = ReplacementSampler::new(5, 9);
        let first = a.next_batch(20).unwrap();
        assert_eq!(first, b.next_batch(20).unwrap());
        assert!(first.iter().all(|&i| i < 5));
        assert_ne!(a.next_batch(20).unwrap(), first);
    }

    #[test]
    fn test_signal_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.csv");
        std::fs::write(&path, "a,b,c,label\n0.1,0.2,0.3,0.0\n0.4,0.5,0.6,3.0\n").unwrap();
        let data = Dataset::from_signal_csv(&path, true).unwrap();
        assert_eq!(data.shape(), (2, 1, 1, 3));
        assert_eq!(data.y.to_vec(), vec![0, 1]);
        assert_eq!(data.x[[1, 0, 0, 2]], 0.6);
    }

    #[test]
    fn test_signal_csv_ragged_rows_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "0.1,0.2,1\n0.3,1\n").unwrap();
        assert!(Dataset::from_signal_csv(&path, false).is_err());
    }

    #[test]
    fn test_shifted_squares_labels_cycle() {
        let data = synthetic::shifted_squares(6, 3, 8, 1).unwrap();
        assert_eq!(data.y.to_vec(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(data.x.index_axis(Axis(0), 2).sum(), 9.0);
    }
}
