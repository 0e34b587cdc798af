//! Flat per-example result tables, exported as CSV and JSON.

use std::path::{Path, PathBuf};

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, XaiError};
use crate::persistence::{atomic_write, atomic_write_json};

/// Which experiment a table records; fixes the column headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    FeatureImportance,
    ExampleImportance,
    ConceptImportance,
    EnforceInvariance,
    Sensitivity,
}

impl TableKind {
    pub fn headers(self) -> [&'static str; 4] {
        match self {
            TableKind::FeatureImportance => [
                "Model Type",
                "Explanation",
                "Model Invariance",
                "Explanation Equivariance",
            ],
            TableKind::ExampleImportance | TableKind::ConceptImportance => [
                "Model Type",
                "Explanation",
                "Model Invariance",
                "Explanation Invariance",
            ],
            TableKind::EnforceInvariance => ["Model Type", "Explanation", "N_inv", "Explanation Invariance"],
            TableKind::Sensitivity => [
                "Model Type",
                "Explanation",
                "Explanation Sensitivity",
                "Explanation Equivariance",
            ],
        }
    }
}

/// One row: the third column is `reference`, the fourth `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub model_type: String,
    pub explanation: String,
    pub reference: f64,
    pub score: f64,
}

/// Mean of the rows sharing a model type and explanation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMean {
    pub model_type: String,
    pub explanation: String,
    pub reference: f64,
    pub score: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsTable {
    kind: TableKind,
    records: Vec<MetricRecord>,
}

#[derive(Serialize)]
struct TableJson<'a> {
    kind: TableKind,
    columns: [&'static str; 4],
    records: &'a [MetricRecord],
}

impl MetricsTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            records: Vec::new(),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, model_type: &str, explanation: &str, reference: f64, score: f64) {
        self.records.push(MetricRecord {
            model_type: model_type.to_string(),
            explanation: explanation.to_string(),
            reference,
            score,
        });
    }

    /// Append one row per example, pairing `reference[i]` with `scores[i]`.
    pub fn extend(
        &mut self,
        model_type: &str,
        explanation: &str,
        reference: &Array1<f64>,
        scores: &Array1<f64>,
    ) -> Result<()> {
        if reference.len() != scores.len() {
            return Err(XaiError::shape(format!(
                "{} reference values for {} scores",
                reference.len(),
                scores.len()
            )));
        }
        for (&r, &s) in reference.iter().zip(scores.iter()) {
            self.push(model_type, explanation, r, s);
        }
        Ok(())
    }

    /// Append one row per score, all sharing the same reference value.
    pub fn extend_constant(&mut self, model_type: &str, explanation: &str, reference: f64, scores: &Array1<f64>) {
        for &s in scores.iter() {
            self.push(model_type, explanation, reference, s);
        }
    }

    /// Means per `(model type, explanation)` in first-appearance order.
    pub fn group_means(&self) -> Vec<GroupMean> {
        let mut groups: Vec<GroupMean> = Vec::new();
        for record in &self.records {
            let existing = groups
                .iter_mut()
                .find(|g| g.model_type == record.model_type && g.explanation == record.explanation);
            match existing {
                Some(group) => {
                    group.reference += record.reference;
                    group.score += record.score;
                    group.count += 1;
                }
                None => groups.push(GroupMean {
                    model_type: record.model_type.clone(),
                    explanation: record.explanation.clone(),
                    reference: record.reference,
                    score: record.score,
                    count: 1,
                }),
            }
        }
        for group in &mut groups {
            group.reference /= group.count as f64;
            group.score /= group.count as f64;
        }
        groups
    }

    pub fn to_csv(&self) -> String {
        let mut csv = self.kind.headers().join(",");
        csv.push('\n');
        for r in &self.records {
            csv.push_str(&format!(
                "{},{},{},{}\n",
                escape_csv(&r.model_type),
                escape_csv(&r.explanation),
                r.reference,
                r.score
            ));
        }
        csv
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        atomic_write(path, self.to_csv().as_bytes())?;
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        atomic_write_json(
            path,
            &TableJson {
                kind: self.kind,
                columns: self.kind.headers(),
                records: &self.records,
            },
        )?;
        Ok(())
    }

    /// Write `metrics.csv` and `metrics.json` into `dir`.
    pub fn write_all(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let csv = dir.join("metrics.csv");
        let json = dir.join("metrics.json");
        self.write_csv(&csv)?;
        self.write_json(&json)?;
        tracing::info!(rows = self.len(), path = %csv.display(), "metrics written");
        Ok((csv, json))
    }
}

/// Simple CSV field escaping.
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
