//! # Fold Feature Transformer
//!
//! Each fold carries the normalization statistics it was trained with. The
//! transform reproduces the training-time features exactly:
//!
//! - `sum_all_log_z`: `(log2(total + 1) - mean) / std` of the total raw count.
//! - every fitted gene: `(value - gene_mean) / gene_std`.
//! - `order`: host order looked up from the host species.
//! - `mean_ISGscore`: mean of the standardized ISG genes.
//!
//! Rows are never filtered here. Arithmetic follows IEEE semantics, so a zero
//! standard deviation yields an infinite or NaN feature exactly as it did in
//! the fitted pipeline; NaN rows are dropped later by the predictors.

use crate::types::{FeatureFrame, SampleFeatureMatrix, columns};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// One row of the species→order table captured at training time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesOrder {
    pub species: String,
    pub order: String,
}

/// Fitted normalization state of one fold. Immutable after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldNormalizer {
    pub log_total_mean: f64,
    pub log_total_std: f64,
    pub gene_means: HashMap<String, f64>,
    pub gene_stds: HashMap<String, f64>,
    pub isg_genes: Vec<String>,
    #[serde(default)]
    pub species_orders: Vec<SpeciesOrder>,
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Failed to read normalizer file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML normalizer file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Normalizer artifact is inconsistent: {0}")]
    InvalidArtifact(String),
    #[error(
        "The fitted normalizer expects {} gene(s) absent from the input: {}. The input gene vocabulary does not match the one used at training time.",
        .0.len(),
        .0.join(", ")
    )]
    UnknownGene(Vec<String>),
}

impl FoldNormalizer {
    pub fn load(path: &Path) -> Result<Self, TransformError> {
        let toml_string = fs::read_to_string(path)?;
        let normalizer: FoldNormalizer = toml::from_str(&toml_string)?;
        normalizer.validate()?;
        Ok(normalizer)
    }

    pub fn validate(&self) -> Result<(), TransformError> {
        let mut unpaired: Vec<&String> = self
            .gene_means
            .keys()
            .filter(|gene| !self.gene_stds.contains_key(*gene))
            .chain(
                self.gene_stds
                    .keys()
                    .filter(|gene| !self.gene_means.contains_key(*gene)),
            )
            .collect();
        if !unpaired.is_empty() {
            unpaired.sort();
            return Err(TransformError::InvalidArtifact(format!(
                "genes without both a mean and a standard deviation: {unpaired:?}"
            )));
        }
        Ok(())
    }

    /// Host order for a species; the first table entry for a species wins.
    pub fn order_for(&self, species: &str) -> Option<&str> {
        self.species_orders
            .iter()
            .find(|entry| entry.species == species)
            .map(|entry| entry.order.as_str())
    }

    /// Applies this fold's fitted normalization to the raw matrix.
    ///
    /// Input genes that the normalizer did not fit are kept unchanged when
    /// they belong to `gene_vocabulary` and dropped otherwise.
    pub fn transform(
        &self,
        matrix: &SampleFeatureMatrix,
        gene_vocabulary: &[String],
    ) -> Result<FeatureFrame, TransformError> {
        let present: HashSet<&str> = matrix.gene_names.iter().map(String::as_str).collect();
        let mut absent: Vec<String> = self
            .gene_means
            .keys()
            .chain(self.isg_genes.iter())
            .filter(|gene| !present.contains(gene.as_str()))
            .cloned()
            .collect();
        if !absent.is_empty() {
            absent.sort();
            absent.dedup();
            return Err(TransformError::UnknownGene(absent));
        }

        let vocabulary: HashSet<&str> = gene_vocabulary.iter().map(String::as_str).collect();
        let kept: Vec<usize> = matrix
            .gene_names
            .iter()
            .enumerate()
            .filter(|(_, gene)| {
                self.gene_means.contains_key(*gene) || vocabulary.contains(gene.as_str())
            })
            .map(|(idx, _)| idx)
            .collect();
        let dropped = matrix.gene_names.len() - kept.len();
        if dropped > 0 {
            log::debug!("Dropped {dropped} input gene column(s) outside the fitted vocabulary");
        }

        let n = matrix.n_samples();
        let width = kept.len() + 2;
        let mut numeric = Array2::<f64>::zeros((n, width));
        let mut numeric_names = Vec::with_capacity(width);

        for (out_col, &in_col) in kept.iter().enumerate() {
            let gene = &matrix.gene_names[in_col];
            let source = matrix.expression.column(in_col);
            let mut target = numeric.column_mut(out_col);
            match (self.gene_means.get(gene), self.gene_stds.get(gene)) {
                (Some(&mean), Some(&std)) => {
                    target.zip_mut_with(&source, |out, &value| *out = (value - mean) / std);
                }
                _ => target.assign(&source),
            }
            numeric_names.push(gene.clone());
        }

        let total_col = kept.len();
        numeric
            .column_mut(total_col)
            .zip_mut_with(&matrix.total_counts, |out, &total| {
                *out = ((total + 1.0).log2() - self.log_total_mean) / self.log_total_std;
            });
        numeric_names.push(columns::SUM_ALL_LOG_Z.to_string());

        let isg_cols: Vec<usize> = self
            .isg_genes
            .iter()
            .filter_map(|gene| numeric_names.iter().position(|name| name == gene))
            .collect();
        let isg_col = total_col + 1;
        let isg_scores: Vec<f64> = numeric
            .axis_iter(Axis(0))
            .map(|row| mean_skipping_nan(isg_cols.iter().map(|&c| row[c])))
            .collect();
        for (row, score) in isg_scores.into_iter().enumerate() {
            numeric[[row, isg_col]] = score;
        }
        numeric_names.push(columns::MEAN_ISG_SCORE.to_string());

        let orders: Vec<Option<String>> = matrix
            .species
            .iter()
            .map(|species| {
                species
                    .as_deref()
                    .and_then(|s| self.order_for(s))
                    .map(str::to_string)
            })
            .collect();

        Ok(FeatureFrame {
            sample_ids: matrix.sample_ids.clone(),
            numeric_names,
            numeric,
            categorical_names: columns::CATEGORICAL.iter().map(|c| c.to_string()).collect(),
            categorical: vec![matrix.species.clone(), orders],
        })
    }
}

/// Arithmetic mean ignoring NaN; NaN when nothing is left to average.
fn mean_skipping_nan(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}
