//! # Cross-Fold Aggregation
//!
//! Combines the stacking predictions of all folds into one final call per
//! sample. Only samples scored by every fold and present in the metadata are
//! reported; the final score is the mean of the fold scores and the final
//! label is the most frequent fold label.

use crate::types::{FoldPrediction, PredictionLabel, SampleMetadata};
use ahash::AHashMap;
use itertools::Itertools;

/// Final call for one sample, with the per-fold values it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPrediction {
    pub metadata: SampleMetadata,
    pub fold_scores: Vec<f64>,
    pub fold_labels: Vec<PredictionLabel>,
    pub mean_score: f64,
    pub label: PredictionLabel,
}

/// Most frequent label. Among equally frequent labels the one that sorts
/// first by name wins. `None` for an empty slice.
pub fn majority_label(labels: &[PredictionLabel]) -> Option<PredictionLabel> {
    labels
        .iter()
        .counts()
        .into_iter()
        .max_by(|(a_label, a_count), (b_label, b_count)| {
            a_count
                .cmp(b_count)
                .then_with(|| b_label.as_str().cmp(a_label.as_str()))
        })
        .map(|(label, _)| *label)
}

/// Inner-joins the metadata with every fold's predictions on ID and reduces
/// each surviving sample to its mean score and majority label. The result is
/// sorted by ID and lists fold values in fold order.
pub fn aggregate_folds(
    metadata: &[SampleMetadata],
    folds: &[Vec<FoldPrediction>],
) -> Vec<AggregatedPrediction> {
    let by_fold: Vec<AHashMap<&str, &FoldPrediction>> = folds
        .iter()
        .map(|predictions| {
            predictions
                .iter()
                .map(|p| (p.sample_id.as_str(), p))
                .collect()
        })
        .collect();

    let mut aggregated: Vec<AggregatedPrediction> = metadata
        .iter()
        .filter_map(|meta| {
            let per_fold: Vec<&FoldPrediction> = by_fold
                .iter()
                .map(|fold| fold.get(meta.sample_id.as_str()).copied())
                .collect::<Option<_>>()?;
            let fold_scores: Vec<f64> = per_fold.iter().map(|p| p.score).collect();
            let fold_labels: Vec<PredictionLabel> = per_fold.iter().map(|p| p.label).collect();
            let label = majority_label(&fold_labels)?;
            let mean_score = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
            Some(AggregatedPrediction {
                metadata: meta.clone(),
                fold_scores,
                fold_labels,
                mean_score,
                label,
            })
        })
        .collect();

    let excluded = metadata.len() - aggregated.len();
    if excluded > 0 {
        log::info!(
            "{excluded} of {} samples lack a stacking prediction in some fold and are not reported",
            metadata.len()
        );
    }

    aggregated.sort_by(|a, b| a.metadata.sample_id.cmp(&b.metadata.sample_id));
    aggregated
}
