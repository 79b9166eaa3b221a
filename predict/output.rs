//! # Prediction Tables
//!
//! Writers for the per-fold and aggregate result tables, plus the reader that
//! loads a fold's first-layer table back for the stacking layer. Every table
//! joins the scores with the sample metadata by ID.

use crate::aggregate::AggregatedPrediction;
use crate::types::{FoldPrediction, ModelFamily, N_FOLDS, SampleMetadata, columns};
use ahash::AHashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FINAL_SCORE_ALL: &str = "Final_Prediction_score(mean)";
pub const FINAL_LABEL_ALL: &str = "Final_Prediction_Label";
pub const FINAL_SCORE: &str = "Prediction_score(mean)";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read or write CSV table '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Table '{path}' has no column named '{column}'.")]
    ColumnNotFound { path: PathBuf, column: String },
    #[error("Table '{path}', line {line}: {message}")]
    MalformedRecord {
        path: PathBuf,
        line: u64,
        message: String,
    },
}

/// A score row read back from a first-layer table.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseScoreRow {
    pub sample_id: String,
    pub family: ModelFamily,
    pub score: f64,
}

pub fn base_table_path(dir: &Path, fold: usize) -> PathBuf {
    dir.join(format!("Infection_Prediction_{fold}.csv"))
}

pub fn stacking_table_path(dir: &Path, fold: usize) -> PathBuf {
    dir.join(format!("Infection_Prediction_Stacking_{fold}_external.csv"))
}

pub fn aggregate_table_path(dir: &Path) -> PathBuf {
    dir.join("Infection_Prediction_Stacking_all.csv")
}

pub fn final_table_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (
        dir.join("Infection_Prediction_Stacking_final.csv"),
        dir.join("Infection_Prediction_Stacking_final.txt"),
    )
}

fn prepare_output_path(path: &Path) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| OutputError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Writes `rows` as a delimited table with `header`.
fn write_table(
    path: &Path,
    delimiter: u8,
    header: &[String],
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Result<(), OutputError> {
    prepare_output_path(path)?;
    let csv_error = |source| OutputError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_path(path)
        .map_err(csv_error)?;
    writer.write_record(header).map_err(csv_error)?;
    for row in rows {
        writer.write_record(&row).map_err(csv_error)?;
    }
    writer.flush().map_err(|source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    log::info!("Wrote '{}'", path.display());
    Ok(())
}

fn metadata_fields(meta: &SampleMetadata) -> [String; 3] {
    [
        meta.sample_id.clone(),
        meta.species.clone().unwrap_or_default(),
        meta.order.clone().unwrap_or_default(),
    ]
}

fn prediction_header() -> Vec<String> {
    [
        columns::ID,
        columns::H_SPECIES,
        columns::ORDER,
        columns::MODEL,
        columns::PREDICTION_SCORE,
        columns::PREDICTION_LABEL,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn prediction_row(meta: &SampleMetadata, prediction: &FoldPrediction) -> Vec<String> {
    let mut row = metadata_fields(meta).to_vec();
    row.push(prediction.family.model_name().to_string());
    row.push(prediction.score.to_string());
    row.push(prediction.label.to_string());
    row
}

/// Writes a first-layer table. Rows follow the metadata order; within a
/// sample, predictions keep their given order.
pub fn write_base_table(
    path: &Path,
    metadata: &[SampleMetadata],
    predictions: &[FoldPrediction],
) -> Result<(), OutputError> {
    let mut by_sample: AHashMap<&str, Vec<&FoldPrediction>> = AHashMap::new();
    for prediction in predictions {
        by_sample
            .entry(prediction.sample_id.as_str())
            .or_default()
            .push(prediction);
    }

    let rows = metadata.iter().flat_map(|meta| {
        by_sample
            .get(meta.sample_id.as_str())
            .into_iter()
            .flatten()
            .map(move |prediction| prediction_row(meta, prediction))
    });
    write_table(path, b',', &prediction_header(), rows)
}

/// Writes a fold's stacking table: metadata inner-joined with the
/// predictions, sorted by ID.
pub fn write_stacking_table(
    path: &Path,
    metadata: &[SampleMetadata],
    predictions: &[FoldPrediction],
) -> Result<(), OutputError> {
    let by_id: AHashMap<&str, &SampleMetadata> = metadata
        .iter()
        .map(|meta| (meta.sample_id.as_str(), meta))
        .collect();

    let mut joined: Vec<(&SampleMetadata, &FoldPrediction)> = predictions
        .iter()
        .filter_map(|p| by_id.get(p.sample_id.as_str()).map(|meta| (*meta, p)))
        .collect();
    joined.sort_by(|a, b| a.0.sample_id.cmp(&b.0.sample_id));

    let rows = joined
        .into_iter()
        .map(|(meta, prediction)| prediction_row(meta, prediction));
    write_table(path, b',', &prediction_header(), rows)
}

/// Reads the ID, Model and score columns of a first-layer table.
pub fn read_base_table(path: &Path) -> Result<Vec<BaseScoreRow>, OutputError> {
    let csv_error = |source| OutputError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();

    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| OutputError::ColumnNotFound {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
    };
    let id_col = position(columns::ID)?;
    let model_col = position(columns::MODEL)?;
    let score_col = position(columns::PREDICTION_SCORE)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let line = record.position().map_or(0, |p| p.line());
        let malformed = |message: String| OutputError::MalformedRecord {
            path: path.to_path_buf(),
            line,
            message,
        };

        let field = |idx: usize| record.get(idx).unwrap_or_default();
        let model_name = field(model_col);
        let family = ModelFamily::from_model_name(model_name)
            .filter(|f| ModelFamily::BASE.contains(f))
            .ok_or_else(|| malformed(format!("'{model_name}' is not a first-layer model")))?;
        let score = field(score_col)
            .parse::<f64>()
            .map_err(|e| malformed(format!("invalid score '{}': {e}", field(score_col))))?;

        rows.push(BaseScoreRow {
            sample_id: field(id_col).to_string(),
            family,
            score,
        });
    }
    Ok(rows)
}

/// Writes the per-fold detail table and both copies of the final table.
/// Returns the written paths.
pub fn write_aggregate_tables(
    dir: &Path,
    aggregated: &[AggregatedPrediction],
) -> Result<Vec<PathBuf>, OutputError> {
    let all_path = aggregate_table_path(dir);
    let mut header: Vec<String> = [columns::ID, columns::H_SPECIES, columns::ORDER]
        .iter()
        .map(|c| c.to_string())
        .collect();
    for fold in 0..N_FOLDS {
        header.push(format!("{}_fold{fold}", columns::PREDICTION_SCORE));
        header.push(format!("{}_fold{fold}", columns::PREDICTION_LABEL));
    }
    header.push(FINAL_SCORE_ALL.to_string());
    header.push(FINAL_LABEL_ALL.to_string());

    let rows = aggregated.iter().map(|sample| {
        let mut row = metadata_fields(&sample.metadata).to_vec();
        for (score, label) in sample.fold_scores.iter().zip(&sample.fold_labels) {
            row.push(score.to_string());
            row.push(label.to_string());
        }
        row.push(sample.mean_score.to_string());
        row.push(sample.label.to_string());
        row
    });
    write_table(&all_path, b',', &header, rows)?;

    let final_header: Vec<String> = [columns::ID, FINAL_SCORE, columns::PREDICTION_LABEL]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let final_rows = || {
        aggregated.iter().map(|sample| {
            vec![
                sample.metadata.sample_id.clone(),
                sample.mean_score.to_string(),
                sample.label.to_string(),
            ]
        })
    };
    let (csv_path, tsv_path) = final_table_paths(dir);
    write_table(&csv_path, b',', &final_header, final_rows())?;
    write_table(&tsv_path, b'\t', &final_header, final_rows())?;

    Ok(vec![all_path, csv_path, tsv_path])
}
