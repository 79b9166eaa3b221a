//! # Input Loading and Validation Module
//!
//! This module is the exclusive entry point for user-provided data. It reads
//! the per-gene count table, the sample metadata table and the gene
//! vocabulary, and assembles the per-sample expression matrix the fold
//! normalizers were fitted on.
//!
//! - Strict Schema: column names are fixed (`sample_id`, `hum_symbol`,
//!   `raw_count`, `type`; `sample_id`, `species_host`, `order_host`).
//! - Zero Filling: every (sample, vocabulary gene) pair missing from the count
//!   table is filled with `raw_count = 0` and `type = ISG`. Genes outside the
//!   vocabulary are discarded.
//! - Control Filter: only samples whose control-gene count exceeds
//!   `CONTROL_SUM_MIN` are kept. The constant is part of the fitted model and
//!   must not be tuned.
//! - All columns are read as text, so identifiers such as `007` keep their
//!   exact spelling in both tables. Cells are trimmed, and a blank cell is a
//!   missing value.
//! - Missing Counts: a `raw_count` cell holding one of `MISSING_VALUE_TOKENS`
//!   (`NA`, `NaN`, `null`, ...) counts as missing and is zero-filled.

use crate::types::{SampleFeatureMatrix, SampleMetadata};
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;
use thiserror::Error;

/// Samples whose summed control-gene raw count is not above this are removed.
pub const CONTROL_SUM_MIN: f64 = 10000.0;

/// Spellings of a missing numeric cell, as written by common table tools.
pub const MISSING_VALUE_TOKENS: [&str; 19] = [
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN", "<NA>",
    "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null", "NAN",
];

/// Counts-per-million scale of the control-normalized expression.
const CPM_SCALE: f64 = 1e6;

const CONTROL_GENE_TYPE: &str = "cntl";

pub mod count_columns {
    pub const SAMPLE_ID: &str = "sample_id";
    pub const HUM_SYMBOL: &str = "hum_symbol";
    pub const RAW_COUNT: &str = "raw_count";
    pub const TYPE: &str = "type";
}

pub mod metadata_columns {
    pub const SAMPLE_ID: &str = "sample_id";
    pub const SPECIES_HOST: &str = "species_host";
    pub const ORDER_HOST: &str = "order_host";
}

/// One row of the per-gene count table.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneCountRecord {
    pub sample_id: String,
    pub gene: Option<String>,
    pub raw_count: f64,
    pub is_control: bool,
}

/// A comprehensive error type for all input loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{column}' was not found in '{path}'. Please check spelling and case."
    )]
    ColumnNotFound { column: String, path: String },
    #[error(
        "Missing values were found in the required column '{0}'. Every row needs a sample identifier."
    )]
    MissingValuesFound(String),
    #[error(
        "The column '{column_name}' could not be read as numbers: found '{value}'."
    )]
    ColumnWrongType { column_name: String, value: String },
    #[error("No input rows left: {0}")]
    EmptyInput(String),
    #[error("The gene list '{0}' contains no gene symbols.")]
    EmptyGeneList(String),
    #[error("Sample '{0}' appears more than once in the metadata table.")]
    DuplicateSample(String),
}

/// Reads the newline-delimited gene vocabulary. Blank lines are skipped and
/// repeated symbols keep their first position.
pub fn load_gene_vocabulary(path: &Path) -> Result<Vec<String>, DataError> {
    let content = fs::read_to_string(path)?;
    let mut seen = HashSet::new();
    let genes: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect();

    if genes.is_empty() {
        return Err(DataError::EmptyGeneList(path.display().to_string()));
    }
    log::debug!("Loaded {} gene symbols from '{}'", genes.len(), path.display());
    Ok(genes)
}

/// Reads the per-gene count table.
pub fn load_gene_counts(path: &Path) -> Result<Vec<GeneCountRecord>, DataError> {
    let df = internal::read_tsv(
        path,
        &[
            count_columns::SAMPLE_ID,
            count_columns::HUM_SYMBOL,
            count_columns::RAW_COUNT,
            count_columns::TYPE,
        ],
    )?;

    let sample_ids = internal::extract_required_strings(&df, count_columns::SAMPLE_ID)?;
    let genes = internal::extract_strings(&df, count_columns::HUM_SYMBOL)?;
    let raw_counts = internal::extract_numbers(&df, count_columns::RAW_COUNT)?;
    let types = internal::extract_strings(&df, count_columns::TYPE)?;

    let records: Vec<GeneCountRecord> = sample_ids
        .into_iter()
        .zip(genes)
        .zip(raw_counts)
        .zip(types)
        .map(|(((sample_id, gene), raw_count), gene_type)| GeneCountRecord {
            sample_id,
            gene,
            // A missing count is zero-filled like an absent gene.
            raw_count: raw_count.unwrap_or(0.0),
            is_control: gene_type.as_deref() == Some(CONTROL_GENE_TYPE),
        })
        .collect();

    log::info!(
        "Loaded {} gene count rows from '{}'",
        records.len(),
        path.display()
    );
    Ok(records)
}

/// Reads the sample metadata table. Identifiers must be unique.
pub fn load_sample_metadata(path: &Path) -> Result<Vec<SampleMetadata>, DataError> {
    let df = internal::read_tsv(
        path,
        &[
            metadata_columns::SAMPLE_ID,
            metadata_columns::SPECIES_HOST,
            metadata_columns::ORDER_HOST,
        ],
    )?;

    let sample_ids = internal::extract_required_strings(&df, metadata_columns::SAMPLE_ID)?;
    let species = internal::extract_strings(&df, metadata_columns::SPECIES_HOST)?;
    let orders = internal::extract_strings(&df, metadata_columns::ORDER_HOST)?;

    let mut seen = HashSet::with_capacity(sample_ids.len());
    let mut metadata = Vec::with_capacity(sample_ids.len());
    for ((sample_id, species), order) in sample_ids.into_iter().zip(species).zip(orders) {
        if !seen.insert(sample_id.clone()) {
            return Err(DataError::DuplicateSample(sample_id));
        }
        metadata.push(SampleMetadata {
            sample_id,
            species,
            order,
        });
    }

    log::info!(
        "Loaded metadata for {} samples from '{}'",
        metadata.len(),
        path.display()
    );
    Ok(metadata)
}

/// Builds the per-sample expression matrix from count rows.
///
/// Gene columns are the vocabulary, sorted. Each cell is
/// `Σ log2(raw / cntl_sum * 1e6 + 1)` over the rows of that (sample, gene).
/// Samples are ordered by identifier and inner-joined with `metadata`.
pub fn build_sample_features(
    records: &[GeneCountRecord],
    gene_vocabulary: &[String],
    metadata: &[SampleMetadata],
) -> Result<SampleFeatureMatrix, DataError> {
    if records.is_empty() {
        return Err(DataError::EmptyInput(
            "the gene count table has no rows to zero-fill".to_string(),
        ));
    }
    if gene_vocabulary.is_empty() {
        return Err(DataError::EmptyInput("the gene vocabulary is empty".to_string()));
    }

    let mut gene_names: Vec<String> = gene_vocabulary.to_vec();
    gene_names.sort();
    gene_names.dedup();
    let gene_index: AHashMap<&str, usize> = gene_names
        .iter()
        .enumerate()
        .map(|(idx, gene)| (gene.as_str(), idx))
        .collect();

    // Per sample, per vocabulary gene: the (raw_count, is_control) rows.
    let mut sample_index: AHashMap<&str, usize> = AHashMap::new();
    let mut sample_order: Vec<&str> = Vec::new();
    let mut cells: Vec<Vec<Vec<(f64, bool)>>> = Vec::new();
    for record in records {
        let sample = *sample_index
            .entry(record.sample_id.as_str())
            .or_insert_with(|| {
                sample_order.push(record.sample_id.as_str());
                cells.push(vec![Vec::new(); gene_names.len()]);
                cells.len() - 1
            });
        let Some(gene) = record.gene.as_deref().and_then(|g| gene_index.get(g)) else {
            continue;
        };
        cells[sample][*gene].push((record.raw_count, record.is_control));
    }

    struct SampleRow<'a> {
        sample_id: &'a str,
        all_sum: f64,
        values: Vec<f64>,
    }

    let mut rows: Vec<SampleRow> = Vec::with_capacity(sample_order.len());
    for (sample_id, genes) in sample_order.iter().zip(cells.iter_mut()) {
        for gene_rows in genes.iter_mut() {
            if gene_rows.is_empty() {
                gene_rows.push((0.0, false));
            }
        }

        let entries = || genes.iter().flat_map(|rows| rows.iter());
        let all_sum: f64 = entries().map(|&(raw, _)| raw).sum();
        let cntl_sum: f64 = entries()
            .filter(|&&(_, is_control)| is_control)
            .map(|&(raw, _)| raw)
            .sum();

        if !(cntl_sum > CONTROL_SUM_MIN) {
            continue;
        }

        let values = genes
            .iter()
            .map(|gene_rows| {
                gene_rows
                    .iter()
                    .map(|&(raw, _)| (raw / cntl_sum * CPM_SCALE + 1.0).log2())
                    .sum()
            })
            .collect();
        rows.push(SampleRow {
            sample_id: *sample_id,
            all_sum,
            values,
        });
    }

    let removed = sample_order.len() - rows.len();
    if removed > 0 {
        log::info!(
            "Removed {removed} of {} samples with a control-gene count not above {CONTROL_SUM_MIN}",
            sample_order.len()
        );
    }
    if rows.is_empty() {
        return Err(DataError::EmptyInput(format!(
            "no sample has a control-gene count above {CONTROL_SUM_MIN}"
        )));
    }

    rows.sort_by(|a, b| a.sample_id.cmp(b.sample_id));

    let metadata_by_id: AHashMap<&str, &SampleMetadata> = metadata
        .iter()
        .map(|m| (m.sample_id.as_str(), m))
        .collect();
    let joined: Vec<(&SampleRow, &SampleMetadata)> = rows
        .iter()
        .filter_map(|row| metadata_by_id.get(row.sample_id).map(|m| (row, *m)))
        .collect();

    let without_metadata = rows.len() - joined.len();
    if without_metadata > 0 {
        log::warn!(
            "{without_metadata} sample(s) have counts but no metadata entry and are skipped"
        );
    }
    if joined.is_empty() {
        return Err(DataError::EmptyInput(
            "no counted sample has an entry in the metadata table".to_string(),
        ));
    }

    let n_genes = gene_names.len();
    let mut expression = Array2::<f64>::zeros((joined.len(), n_genes));
    for (row_idx, (row, _)) in joined.iter().enumerate() {
        for (col, &value) in row.values.iter().enumerate() {
            expression[[row_idx, col]] = value;
        }
    }

    Ok(SampleFeatureMatrix {
        sample_ids: joined.iter().map(|(row, _)| row.sample_id.to_string()).collect(),
        gene_names,
        expression,
        total_counts: Array1::from_iter(joined.iter().map(|(row, _)| row.all_sum)),
        species: joined.iter().map(|(_, m)| m.species.clone()).collect(),
    })
}

/// Internal module for shared table reading logic.
mod internal {
    use super::*;

    /// Reads a tab-separated file with every column as text and checks that
    /// the required columns exist.
    pub(super) fn read_tsv(path: &Path, required: &[&str]) -> Result<DataFrame, DataError> {
        log::info!("Loading data from '{}'", path.display());

        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(Some(0))
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let present: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for column in required {
            if !present.contains(*column) {
                return Err(DataError::ColumnNotFound {
                    column: column.to_string(),
                    path: path.display().to_string(),
                });
            }
        }

        Ok(df)
    }

    pub(super) fn extract_strings(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let casted = df.column(column_name)?.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|value| {
                value
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .collect();
        Ok(values)
    }

    pub(super) fn extract_required_strings(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        extract_strings(df, column_name)?
            .into_iter()
            .map(|value| {
                value.ok_or_else(|| DataError::MissingValuesFound(column_name.to_string()))
            })
            .collect()
    }

    /// Parses a text column as floats. Blank cells, missing-value tokens and
    /// NaN are all returned as `None`.
    pub(super) fn extract_numbers(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, DataError> {
        extract_strings(df, column_name)?
            .into_iter()
            .map(|value| match value {
                None => Ok(None),
                Some(text) if MISSING_VALUE_TOKENS.contains(&text.as_str()) => Ok(None),
                Some(text) => match text.parse::<f64>() {
                    Ok(number) if number.is_nan() => Ok(None),
                    Ok(number) => Ok(Some(number)),
                    Err(_) => Err(DataError::ColumnWrongType {
                        column_name: column_name.to_string(),
                        value: text,
                    }),
                },
            })
            .collect()
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// A robust helper to create a temporary TSV file for testing.
    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn record(sample: &str, gene: &str, raw: f64, control: bool) -> GeneCountRecord {
        GeneCountRecord {
            sample_id: sample.to_string(),
            gene: Some(gene.to_string()),
            raw_count: raw,
            is_control: control,
        }
    }

    fn meta(sample: &str, species: &str) -> SampleMetadata {
        SampleMetadata {
            sample_id: sample.to_string(),
            species: Some(species.to_string()),
            order: None,
        }
    }

    fn vocabulary() -> Vec<String> {
        vec!["MX1".into(), "ACTB".into(), "IFIT1".into()]
    }

    #[test]
    fn zero_fills_missing_genes_and_sorts_columns() {
        let records = vec![
            record("s1", "ACTB", 20000.0, true),
            record("s1", "MX1", 20.0, false),
        ];
        let matrix =
            build_sample_features(&records, &vocabulary(), &[meta("s1", "Homo sapiens")]).unwrap();

        assert_eq!(matrix.gene_names, vec!["ACTB", "IFIT1", "MX1"]);
        // IFIT1 was absent: log2(0 / cntl * 1e6 + 1) = 0.
        assert_abs_diff_eq!(matrix.expression[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            matrix.expression[[0, 2]],
            (20.0 / 20000.0 * 1e6 + 1.0_f64).log2(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(matrix.expression[[0, 0]], (1e6 + 1.0_f64).log2(), epsilon = 1e-12);
        assert_abs_diff_eq!(matrix.total_counts[0], 20020.0, epsilon = 1e-12);
        assert_eq!(matrix.species, vec![Some("Homo sapiens".to_string())]);
    }

    #[test]
    fn genes_outside_vocabulary_do_not_count() {
        let records = vec![
            record("s1", "ACTB", 20000.0, true),
            record("s1", "GAPDH", 50000.0, true),
        ];
        let matrix =
            build_sample_features(&records, &vocabulary(), &[meta("s1", "Homo sapiens")]).unwrap();
        assert_abs_diff_eq!(matrix.total_counts[0], 20000.0, epsilon = 1e-12);
        assert_eq!(matrix.gene_names.len(), 3);
    }

    #[test]
    fn control_filter_is_strict() {
        let records = vec![
            record("low", "ACTB", 10000.0, true),
            record("high", "ACTB", 10000.5, true),
        ];
        let matrix = build_sample_features(
            &records,
            &vocabulary(),
            &[meta("low", "Homo sapiens"), meta("high", "Homo sapiens")],
        )
        .unwrap();
        assert_eq!(matrix.sample_ids, vec!["high"]);
    }

    #[test]
    fn samples_sorted_and_joined_with_metadata() {
        let records = vec![
            record("s9", "ACTB", 20000.0, true),
            record("s2", "ACTB", 30000.0, true),
            record("s5", "ACTB", 40000.0, true),
        ];
        let matrix = build_sample_features(
            &records,
            &vocabulary(),
            &[meta("s9", "Mus musculus"), meta("s2", "Homo sapiens")],
        )
        .unwrap();
        assert_eq!(matrix.sample_ids, vec!["s2", "s9"]);
        assert_eq!(
            matrix.species,
            vec![Some("Homo sapiens".to_string()), Some("Mus musculus".to_string())]
        );
    }

    #[test]
    fn duplicate_rows_are_summed() {
        let records = vec![
            record("s1", "ACTB", 20000.0, true),
            record("s1", "MX1", 10.0, false),
            record("s1", "MX1", 30.0, false),
        ];
        let matrix =
            build_sample_features(&records, &vocabulary(), &[meta("s1", "Homo sapiens")]).unwrap();
        let expected =
            (10.0 / 20000.0 * 1e6 + 1.0_f64).log2() + (30.0 / 20000.0 * 1e6 + 1.0_f64).log2();
        assert_abs_diff_eq!(matrix.expression[[0, 2]], expected, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix.total_counts[0], 20040.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_inputs_are_fatal() {
        let err = build_sample_features(&[], &vocabulary(), &[]).unwrap_err();
        assert!(matches!(err, DataError::EmptyInput(_)));

        let records = vec![record("s1", "ACTB", 5.0, true)];
        let err = build_sample_features(&records, &vocabulary(), &[meta("s1", "Homo sapiens")])
            .unwrap_err();
        assert!(matches!(err, DataError::EmptyInput(_)));

        let records = vec![record("s1", "ACTB", 50000.0, true)];
        let err = build_sample_features(&records, &vocabulary(), &[meta("other", "Homo sapiens")])
            .unwrap_err();
        assert!(matches!(err, DataError::EmptyInput(_)));
    }

    #[test]
    fn load_gene_counts_reads_text_columns() {
        let file = create_test_tsv(
            "sample_id\thum_symbol\traw_count\ttype\textra\n007\tACTB\t12000\tcntl\tx\n007\tMX1\t\tISG\ty",
        )
        .unwrap();
        let records = load_gene_counts(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sample_id, "007");
        assert!(records[0].is_control);
        assert_abs_diff_eq!(records[0].raw_count, 12000.0, epsilon = 1e-12);
        assert_eq!(records[1].raw_count, 0.0);
        assert!(!records[1].is_control);
    }

    #[test]
    fn missing_count_tokens_are_zero_filled() {
        let file = create_test_tsv(
            "sample_id\thum_symbol\traw_count\ttype\n\
             s1\tACTB\t15000\tcntl\n\
             s1\tMX1\tNaN\tISG\n\
             s1\tIFIT1\tNA\tISG\n\
             s1\tMX1\tnull\tISG\n\
             s1\tMX1\t7\tISG",
        )
        .unwrap();
        let records = load_gene_counts(file.path()).unwrap();
        let counts: Vec<f64> = records.iter().map(|r| r.raw_count).collect();
        assert_eq!(counts, vec![15000.0, 0.0, 0.0, 0.0, 7.0]);

        let matrix =
            build_sample_features(&records, &vocabulary(), &[meta("s1", "Homo sapiens")]).unwrap();
        assert_abs_diff_eq!(matrix.total_counts[0], 15007.0, epsilon = 1e-12);
        assert!(matrix.expression.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn load_gene_counts_requires_columns() {
        let file =
            create_test_tsv("sample_id\thum_symbol\tcount\ttype\ns1\tACTB\t1\tcntl").unwrap();
        match load_gene_counts(file.path()) {
            Err(DataError::ColumnNotFound { column, .. }) => assert_eq!(column, "raw_count"),
            other => panic!("Expected ColumnNotFound(raw_count), got {other:?}"),
        }
    }

    #[test]
    fn load_gene_counts_rejects_text_counts() {
        let file = create_test_tsv(
            "sample_id\thum_symbol\traw_count\ttype\ns1\tACTB\tmany\tcntl",
        )
        .unwrap();
        assert!(matches!(
            load_gene_counts(file.path()),
            Err(DataError::ColumnWrongType { .. })
        ));
    }

    #[test]
    fn load_metadata_keeps_missing_annotations_and_rejects_duplicates() {
        let file = create_test_tsv(
            "sample_id\tspecies_host\torder_host\ns1\tHomo sapiens\tPrimates\ns2\tMyotis lucifugus\t",
        )
        .unwrap();
        let metadata = load_sample_metadata(file.path()).unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].order.as_deref(), Some("Primates"));
        assert_eq!(metadata[1].order, None);

        let file = create_test_tsv(
            "sample_id\tspecies_host\torder_host\ns1\tHomo sapiens\tPrimates\ns1\tHomo sapiens\tPrimates",
        )
        .unwrap();
        assert!(matches!(
            load_sample_metadata(file.path()),
            Err(DataError::DuplicateSample(id)) if id == "s1"
        ));
    }

    #[test]
    fn gene_vocabulary_skips_blanks_and_repeats() {
        let file = create_test_tsv("MX1\n\nIFIT1\nMX1\n").unwrap();
        assert_eq!(load_gene_vocabulary(file.path()).unwrap(), vec!["MX1", "IFIT1"]);

        let empty = create_test_tsv("\n").unwrap();
        assert!(matches!(
            load_gene_vocabulary(empty.path()),
            Err(DataError::EmptyGeneList(_))
        ));
    }
}
