//! # Categorical Encoding and the Category Guard
//!
//! Each fold and model family owns an encoder whose category lists were frozen
//! at training time. Before encoding, every categorical value outside its
//! column's frozen list (a missing value included) is rewritten to the
//! `"unknown"` sentinel, so inference never produces a column the model has
//! not seen.

use crate::types::{FeatureFrame, columns::UNKNOWN_CATEGORY};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// What the encoder does with a value outside its vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleUnknown {
    /// Fail the transform.
    #[default]
    Error,
    /// Emit an all-zero block for the column.
    Ignore,
}

/// A fitted one-hot encoder. `categories[i]` is the frozen vocabulary of
/// `columns[i]`, in output column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoricalEncoder {
    pub columns: Vec<String>,
    pub categories: Vec<Vec<String>>,
    #[serde(default)]
    pub handle_unknown: HandleUnknown,
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Failed to read encoder file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML encoder file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Encoder declares {columns} columns but {vocabularies} category lists.")]
    MismatchedVocabularies { columns: usize, vocabularies: usize },
    #[error("The encoder expects the categorical column '{0}', which is not in the feature table.")]
    ColumnNotFound(String),
    #[error(
        "Category '{value}' of column '{column}' is outside the encoder vocabulary and unknown values are rejected."
    )]
    UnknownCategory { column: String, value: String },
}

/// Replaces every value absent from `vocabulary` with the `"unknown"` sentinel.
/// Missing values are treated as absent. Applying it twice changes nothing.
pub fn replace_unseen_categories(
    values: &[Option<String>],
    vocabulary: &[String],
) -> Vec<Option<String>> {
    let valid: HashSet<&str> = vocabulary.iter().map(String::as_str).collect();
    values
        .iter()
        .map(|value| match value {
            Some(v) if valid.contains(v.as_str()) => Some(v.clone()),
            _ => Some(UNKNOWN_CATEGORY.to_string()),
        })
        .collect()
}

impl CategoricalEncoder {
    pub fn load(path: &Path) -> Result<Self, EncodeError> {
        let toml_string = fs::read_to_string(path)?;
        let encoder: CategoricalEncoder = toml::from_str(&toml_string)?;
        encoder.validate()?;
        Ok(encoder)
    }

    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.columns.len() != self.categories.len() {
            return Err(EncodeError::MismatchedVocabularies {
                columns: self.columns.len(),
                vocabularies: self.categories.len(),
            });
        }
        Ok(())
    }

    /// Output column names, `{column}_{category}` in vocabulary order.
    pub fn feature_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .zip(&self.categories)
            .flat_map(|(column, cats)| cats.iter().map(move |cat| format!("{column}_{cat}")))
            .collect()
    }

    /// Applies the category guard to every column this encoder knows.
    pub fn guard(&self, frame: &FeatureFrame) -> Result<FeatureFrame, EncodeError> {
        let mut guarded = frame.clone();
        for (column, vocabulary) in self.columns.iter().zip(&self.categories) {
            let idx = guarded
                .categorical_names
                .iter()
                .position(|name| name == column)
                .ok_or_else(|| EncodeError::ColumnNotFound(column.clone()))?;
            guarded.categorical[idx] =
                replace_unseen_categories(&guarded.categorical[idx], vocabulary);
        }
        Ok(guarded)
    }

    /// One-hot encodes the frame's categorical columns. Shape:
    /// [n_rows, feature_names().len()].
    pub fn transform(&self, frame: &FeatureFrame) -> Result<Array2<f64>, EncodeError> {
        let width: usize = self.categories.iter().map(Vec::len).sum();
        let mut encoded = Array2::<f64>::zeros((frame.n_rows(), width));

        let mut offset = 0;
        for (column, vocabulary) in self.columns.iter().zip(&self.categories) {
            let values = frame
                .categorical_column(column)
                .ok_or_else(|| EncodeError::ColumnNotFound(column.clone()))?;

            for (row, value) in values.iter().enumerate() {
                let value = value.as_deref().unwrap_or(UNKNOWN_CATEGORY);
                match vocabulary.iter().position(|cat| cat == value) {
                    Some(pos) => encoded[[row, offset + pos]] = 1.0,
                    None => match self.handle_unknown {
                        HandleUnknown::Ignore => {}
                        HandleUnknown::Error => {
                            return Err(EncodeError::UnknownCategory {
                                column: column.clone(),
                                value: value.to_string(),
                            });
                        }
                    },
                }
            }
            offset += vocabulary.len();
        }

        Ok(encoded)
    }
}
