// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Only types shared between modules live here; single-module types stay with
// their module.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of independently trained folds in the ensemble.
pub const N_FOLDS: usize = 5;

/// Column names used by every stage after input loading.
pub mod columns {
    pub const ID: &str = "ID";
    pub const H_SPECIES: &str = "h_species";
    pub const ORDER: &str = "order";
    pub const MODEL: &str = "Model";
    pub const PREDICTION_SCORE: &str = "Prediction_score";
    pub const PREDICTION_LABEL: &str = "Prediction_Label";
    pub const SUM_ALL_LOG_Z: &str = "sum_all_log_z";
    pub const MEAN_ISG_SCORE: &str = "mean_ISGscore";

    /// Categorical source columns, in the order the encoders were fitted on.
    pub const CATEGORICAL: [&str; 2] = [H_SPECIES, ORDER];

    /// Sentinel category substituted for values outside a frozen vocabulary.
    pub const UNKNOWN_CATEGORY: &str = "unknown";
}

/// The artifact slot a fitted object belongs to.
///
/// `Lgb` and `Lr` are the first-layer learners; `Meta` is the stacking model
/// trained on their scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Lgb,
    Lr,
    Meta,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [ModelFamily::Lgb, ModelFamily::Lr, ModelFamily::Meta];
    pub const BASE: [ModelFamily; 2] = [ModelFamily::Lgb, ModelFamily::Lr];

    /// Short tag used in artifact file names (`encoder_lgb_0.toml`).
    pub fn file_tag(self) -> &'static str {
        match self {
            Self::Lgb => "lgb",
            Self::Lr => "lr",
            Self::Meta => "meta",
        }
    }

    /// Value of the `Model` column in the prediction tables.
    pub fn model_name(self) -> &'static str {
        match self {
            Self::Lgb => "LightGBM",
            Self::Lr => "LogisticRegression",
            Self::Meta => "Stacking",
        }
    }

    pub fn from_model_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.model_name() == name)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_tag())
    }
}

/// Binary infection status. Declaration order doubles as the lexicographic
/// order of the rendered names, which the majority vote relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PredictionLabel {
    Negative,
    Positive,
}

impl PredictionLabel {
    /// A score at or above the threshold is positive.
    #[inline]
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            Self::Positive
        } else {
            Self::Negative
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negative => "Negative",
            Self::Positive => "Positive",
        }
    }
}

impl fmt::Display for PredictionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Negative" | "0" => Ok(Self::Negative),
            "Positive" | "1" => Ok(Self::Positive),
            other => Err(format!(
                "Invalid prediction label '{other}'. Expected 'Negative' or 'Positive'."
            )),
        }
    }
}

/// One scored sample from one model of one fold.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldPrediction {
    pub sample_id: String,
    pub family: ModelFamily,
    pub score: f64,
    pub label: PredictionLabel,
}

/// Host annotations of one sample as given in the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMetadata {
    pub sample_id: String,
    pub species: Option<String>,
    pub order: Option<String>,
}

/// Per-sample expression table produced by input loading, before any fold
/// normalization. Every gene of the vocabulary is present for every sample.
#[derive(Debug, Clone)]
pub struct SampleFeatureMatrix {
    pub sample_ids: Vec<String>,
    pub gene_names: Vec<String>,
    /// Shape: [n_samples, gene_names.len()].
    pub expression: Array2<f64>,
    /// Total raw count over all genes of each sample.
    pub total_counts: Array1<f64>,
    pub species: Vec<Option<String>>,
}

impl SampleFeatureMatrix {
    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }
}

/// The working table of one fold: named numeric columns (NaN marks a missing
/// value) next to named categorical columns.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    pub sample_ids: Vec<String>,
    pub numeric_names: Vec<String>,
    /// Shape: [n_samples, numeric_names.len()].
    pub numeric: Array2<f64>,
    pub categorical_names: Vec<String>,
    /// One vector per entry of `categorical_names`, each of length n_samples.
    pub categorical: Vec<Vec<Option<String>>>,
}

impl FeatureFrame {
    pub fn n_rows(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn categorical_column(&self, name: &str) -> Option<&[Option<String>]> {
        self.categorical_names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.categorical[idx].as_slice())
    }

    /// Rows with a NaN in any numeric column. Categorical cells never count
    /// here: missing categories are handled by the category guard.
    pub fn rows_with_missing_values(&self) -> Vec<bool> {
        self.numeric
            .axis_iter(Axis(0))
            .map(|row| row.iter().any(|v| v.is_nan()))
            .collect()
    }

    /// Copy of the frame keeping only the rows whose flag is `false`.
    pub fn without_rows(&self, drop: &[bool]) -> FeatureFrame {
        let keep: Vec<usize> = drop
            .iter()
            .enumerate()
            .filter_map(|(idx, &dropped)| (!dropped).then_some(idx))
            .collect();

        FeatureFrame {
            sample_ids: keep.iter().map(|&i| self.sample_ids[i].clone()).collect(),
            numeric_names: self.numeric_names.clone(),
            numeric: self.numeric.select(Axis(0), &keep),
            categorical_names: self.categorical_names.clone(),
            categorical: self
                .categorical
                .iter()
                .map(|column| keep.iter().map(|&i| column[i].clone()).collect())
                .collect(),
        }
    }
}
