// ========================================================================================
//
//                               The fold orchestrator
//
// ========================================================================================
//
// Owns the artifact bundle and the loaded input for one run. Every fold runs its
// first-layer scoring, persists the long score table, reads it back and scores the
// stacking model; the folds run on the rayon pool and share the bundle by reference.
// The aggregate tables are written once all folds have finished.

use crate::aggregate::aggregate_folds;
use crate::artifacts::{ArtifactError, ModelArtifactBundle};
use crate::base::{PredictError, predict_base_fold};
use crate::data::{self, DataError};
use crate::meta::predict_meta_fold;
use crate::output::{self, OutputError};
use crate::types::{FoldPrediction, N_FOLDS, SampleFeatureMatrix, SampleMetadata};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Everything one run needs to know, resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub gene_count_file: PathBuf,
    pub metadata: PathBuf,
    pub output: PathBuf,
    pub model_dir: PathBuf,
    pub gene_list: PathBuf,
    /// Worker count for the fold pool. `None` uses rayon's global pool.
    pub threads: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            gene_count_file: PathBuf::from("input/per_gene_count.tsv"),
            metadata: PathBuf::from("input/sample_metadata.tsv"),
            output: PathBuf::from("output"),
            model_dir: PathBuf::from("model_dir"),
            gene_list: PathBuf::from("reference/gene_list.txt"),
            threads: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("Failed to build the fold worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub n_samples: usize,
    pub n_reported: usize,
    pub written: Vec<PathBuf>,
}

/// Inputs shared read-only by every fold worker.
struct FoldInputs<'a> {
    bundle: &'a ModelArtifactBundle,
    matrix: &'a SampleFeatureMatrix,
    gene_vocabulary: &'a [String],
    metadata: &'a [SampleMetadata],
    output_dir: &'a Path,
}

/// Runs the complete inference for one configuration.
pub fn run(config: &RunConfig) -> Result<RunSummary, PipelineError> {
    let start = Instant::now();

    let bundle = ModelArtifactBundle::load(&config.model_dir)?;
    let gene_vocabulary = data::load_gene_vocabulary(&config.gene_list)?;
    let metadata = data::load_sample_metadata(&config.metadata)?;
    let records = data::load_gene_counts(&config.gene_count_file)?;
    let matrix = data::build_sample_features(&records, &gene_vocabulary, &metadata)?;
    log::info!(
        "Scoring {} samples over {} genes",
        matrix.n_samples(),
        matrix.gene_names.len()
    );

    let inputs = FoldInputs {
        bundle: &bundle,
        matrix: &matrix,
        gene_vocabulary: &gene_vocabulary,
        metadata: &metadata,
        output_dir: &config.output,
    };
    let folds = match config.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?
            .install(|| run_all_folds(&inputs))?,
        None => run_all_folds(&inputs)?,
    };

    let mut written: Vec<PathBuf> = (0..N_FOLDS)
        .flat_map(|fold| {
            [
                output::base_table_path(&config.output, fold),
                output::stacking_table_path(&config.output, fold),
            ]
        })
        .collect();

    let aggregated = aggregate_folds(&metadata, &folds);
    if aggregated.is_empty() {
        log::warn!("No sample received a stacking prediction from every fold");
    }
    written.extend(output::write_aggregate_tables(&config.output, &aggregated)?);

    log::info!(
        "Predicted {} of {} samples in {:.2?}",
        aggregated.len(),
        matrix.n_samples(),
        start.elapsed()
    );
    Ok(RunSummary {
        n_samples: matrix.n_samples(),
        n_reported: aggregated.len(),
        written,
    })
}

/// Runs every fold on the current rayon pool. Results come back in fold
/// order; the first failing fold aborts the run.
fn run_all_folds(inputs: &FoldInputs) -> Result<Vec<Vec<FoldPrediction>>, PipelineError> {
    (0..N_FOLDS)
        .into_par_iter()
        .map(|fold| run_fold(inputs, fold))
        .collect()
}

fn run_fold(inputs: &FoldInputs, fold: usize) -> Result<Vec<FoldPrediction>, PipelineError> {
    let base = predict_base_fold(inputs.bundle, fold, inputs.matrix, inputs.gene_vocabulary)?;
    let base_path = output::base_table_path(inputs.output_dir, fold);
    output::write_base_table(&base_path, inputs.metadata, &base)?;

    // The stacking layer consumes the persisted table, not the in-memory rows.
    let base_rows = output::read_base_table(&base_path)?;
    let stacking = predict_meta_fold(
        inputs.bundle,
        fold,
        inputs.matrix,
        inputs.gene_vocabulary,
        &base_rows,
    )?;
    output::write_stacking_table(
        &output::stacking_table_path(inputs.output_dir, fold),
        inputs.metadata,
        &stacking,
    )?;

    log::info!(
        "Fold {fold}: {} first-layer and {} stacking predictions",
        base.len(),
        stacking.len()
    );
    Ok(stacking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_working_directory_layout() {
        let config = RunConfig::default();
        assert_eq!(config.gene_count_file, PathBuf::from("input/per_gene_count.tsv"));
        assert_eq!(config.gene_list, PathBuf::from("reference/gene_list.txt"));
        assert_eq!(config.threads, None);
    }

    #[test]
    fn missing_model_directory_fails_before_reading_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            gene_count_file: dir.path().join("absent.tsv"),
            metadata: dir.path().join("absent_meta.tsv"),
            output: dir.path().join("out"),
            model_dir: dir.path().join("models"),
            gene_list: dir.path().join("genes.txt"),
            threads: Some(1),
        };
        assert!(matches!(
            run(&config),
            Err(PipelineError::Artifact(ArtifactError::MissingArtifacts(_)))
        ));
        assert!(!config.output.exists());
    }
}
