//! # Stacking Layer
//!
//! Turns a fold's first-layer scores into meta features and scores them with
//! the fold's meta model:
//!
//! 1. pivot the long score table to one column per first-layer model, one row
//!    per sample (sorted by ID, absent pairs filled with 0);
//! 2. z-score each model column over the current batch with the n - 1
//!    standard deviation;
//! 3. attach the guarded host categories of the re-normalized features by ID;
//! 4. score exactly as the first layer does.
//!
//! The z-score statistics come from the batch being predicted, not from
//! training, so a sample's meta score depends on the rest of the batch. The
//! fitted pipeline behaves the same way and the behavior is kept.

use crate::artifacts::ModelArtifactBundle;
use crate::base::{FamilyPredictor, PredictError};
use crate::output::BaseScoreRow;
use crate::types::{FeatureFrame, FoldPrediction, ModelFamily, SampleFeatureMatrix, columns};
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1};
use std::collections::BTreeMap;

/// First-layer scores, one row per sample and one column per model.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorePivot {
    pub sample_ids: Vec<String>,
    pub models: Vec<ModelFamily>,
    /// Shape: [sample_ids.len(), models.len()].
    pub scores: Array2<f64>,
}

/// Pivots long score rows by ID and model. Repeated (sample, model) pairs are
/// averaged; pairs never observed are 0.
pub fn pivot_scores(rows: &[BaseScoreRow]) -> ScorePivot {
    let models = ModelFamily::BASE.to_vec();
    let mut sums: BTreeMap<&str, Vec<(f64, usize)>> = BTreeMap::new();
    for row in rows {
        let Some(col) = models.iter().position(|m| *m == row.family) else {
            continue;
        };
        let cells = sums
            .entry(row.sample_id.as_str())
            .or_insert_with(|| vec![(0.0, 0); models.len()]);
        cells[col].0 += row.score;
        cells[col].1 += 1;
    }

    let mut scores = Array2::<f64>::zeros((sums.len(), models.len()));
    for (row_idx, cells) in sums.values().enumerate() {
        for (col, &(sum, count)) in cells.iter().enumerate() {
            if count > 0 {
                scores[[row_idx, col]] = sum / count as f64;
            }
        }
    }

    ScorePivot {
        sample_ids: sums.keys().map(|id| id.to_string()).collect(),
        models,
        scores,
    }
}

/// Standardizes a column against its own mean and n - 1 standard deviation,
/// both taken over the non-NaN values. NaN inputs stay NaN; with fewer than
/// two non-NaN values every result is NaN.
pub fn batch_zscore(values: ArrayView1<f64>) -> Array1<f64> {
    let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let n = present.len();
    if n < 2 {
        return Array1::from_elem(values.len(), f64::NAN);
    }
    let mean = present.iter().sum::<f64>() / n as f64;
    let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std = variance.sqrt();
    values.mapv(|v| (v - mean) / std)
}

/// Builds the meta feature frame of a fold: z-scored first-layer columns named
/// after the models, plus the host categories left-joined by ID.
pub fn build_meta_frame(pivot: &ScorePivot, categories: &FeatureFrame) -> FeatureFrame {
    let mut numeric = Array2::<f64>::zeros(pivot.scores.raw_dim());
    for (col, mut target) in numeric.columns_mut().into_iter().enumerate() {
        target.assign(&batch_zscore(pivot.scores.column(col)));
    }

    let row_of: AHashMap<&str, usize> = categories
        .sample_ids
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.as_str(), idx))
        .collect();
    let categorical: Vec<Vec<Option<String>>> = columns::CATEGORICAL
        .iter()
        .map(|name| {
            let source = categories.categorical_column(name);
            pivot
                .sample_ids
                .iter()
                .map(|id| {
                    let row = row_of.get(id.as_str())?;
                    source.and_then(|values| values[*row].clone())
                })
                .collect()
        })
        .collect();

    FeatureFrame {
        sample_ids: pivot.sample_ids.clone(),
        numeric_names: pivot
            .models
            .iter()
            .map(|m| m.model_name().to_string())
            .collect(),
        numeric,
        categorical_names: columns::CATEGORICAL.iter().map(|c| c.to_string()).collect(),
        categorical,
    }
}

/// Scores a fold's stacking model from the reloaded first-layer table.
pub fn predict_meta_fold(
    bundle: &ModelArtifactBundle,
    fold: usize,
    matrix: &SampleFeatureMatrix,
    gene_vocabulary: &[String],
    base_rows: &[BaseScoreRow],
) -> Result<Vec<FoldPrediction>, PredictError> {
    let pivot = pivot_scores(base_rows);
    let predictor = FamilyPredictor::from_bundle(bundle, ModelFamily::Meta, fold)?;

    let frame = bundle.normalizer(fold)?.transform(matrix, gene_vocabulary)?;
    let guarded = predictor.encoder.guard(&frame)?;
    let categories = guarded.without_rows(&guarded.rows_with_missing_values());

    let meta_frame = build_meta_frame(&pivot, &categories);
    predictor.predict(&meta_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{CategoricalEncoder, HandleUnknown};
    use crate::model::{FittedModel, LogisticModel};
    use crate::normalizer::{FoldNormalizer, SpeciesOrder};
    use crate::types::{N_FOLDS, PredictionLabel};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::collections::HashMap;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn host_encoder(species: &[&str], orders: &[&str]) -> CategoricalEncoder {
        CategoricalEncoder {
            columns: strings(&[columns::H_SPECIES, columns::ORDER]),
            categories: vec![strings(species), strings(orders)],
            handle_unknown: HandleUnknown::Error,
        }
    }

    fn logistic(features: &[&str], coefficients: Vec<f64>) -> FittedModel {
        FittedModel::Logistic(LogisticModel {
            feature_names: strings(features),
            coefficients,
            intercept: 0.0,
        })
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    /// The first-layer encoders know both host species; the stacking encoder
    /// only knows Homo sapiens. The stacking model scores nothing but the
    /// `unknown` indicators.
    fn bundle() -> ModelArtifactBundle {
        let normalizer = FoldNormalizer {
            log_total_mean: 10.0,
            log_total_std: 1.0,
            gene_means: HashMap::from([("MX1".to_string(), 1.0)]),
            gene_stds: HashMap::from([("MX1".to_string(), 2.0)]),
            isg_genes: strings(&["MX1"]),
            species_orders: vec![
                SpeciesOrder {
                    species: "Homo sapiens".into(),
                    order: "Primates".into(),
                },
                SpeciesOrder {
                    species: "Mus musculus".into(),
                    order: "Rodentia".into(),
                },
            ],
        };
        let base_encoder = host_encoder(
            &["Homo sapiens", "Mus musculus", "unknown"],
            &["Primates", "Rodentia", "unknown"],
        );
        let meta_encoder = host_encoder(&["Homo sapiens", "unknown"], &["Primates", "unknown"]);
        let base_model = logistic(&["MX1"], vec![1.0]);
        let meta_model = logistic(
            &["LightGBM", "LogisticRegression", "h_species_unknown", "order_unknown"],
            vec![0.0, 0.0, 1.0, 2.0],
        );

        let mut encoders = BTreeMap::new();
        let mut models = BTreeMap::new();
        let mut thresholds = BTreeMap::new();
        for family in ModelFamily::ALL {
            let (encoder, model) = match family {
                ModelFamily::Meta => (&meta_encoder, &meta_model),
                _ => (&base_encoder, &base_model),
            };
            encoders.insert(family, vec![encoder.clone(); N_FOLDS]);
            models.insert(family, vec![model.clone(); N_FOLDS]);
            thresholds.insert(family, Array1::from_elem(N_FOLDS, 0.6));
        }
        ModelArtifactBundle::from_parts(vec![normalizer; N_FOLDS], encoders, models, thresholds)
            .unwrap()
    }

    /// Sample `c` has a missing expression value, so it has no row in the
    /// re-normalized category table.
    fn matrix() -> SampleFeatureMatrix {
        SampleFeatureMatrix {
            sample_ids: strings(&["a", "b", "c"]),
            gene_names: strings(&["MX1"]),
            expression: array![[1.5], [0.5], [f64::NAN]],
            total_counts: array![1000.0, 2000.0, 1500.0],
            species: vec![
                Some("Homo sapiens".into()),
                Some("Mus musculus".into()),
                Some("Homo sapiens".into()),
            ],
        }
    }

    fn base_rows(lr_scores: [f64; 3]) -> Vec<BaseScoreRow> {
        let mut rows = vec![
            row("a", ModelFamily::Lgb, 0.2),
            row("b", ModelFamily::Lgb, 0.4),
            row("c", ModelFamily::Lgb, 0.9),
        ];
        for (id, score) in ["a", "b", "c"].into_iter().zip(lr_scores) {
            rows.push(row(id, ModelFamily::Lr, score));
        }
        rows
    }

    fn row(id: &str, family: ModelFamily, score: f64) -> BaseScoreRow {
        BaseScoreRow {
            sample_id: id.to_string(),
            family,
            score,
        }
    }

    #[test]
    fn pivot_sorts_ids_and_fills_absent_scores() {
        let pivot = pivot_scores(&[
            row("s3", ModelFamily::Lgb, 0.9),
            row("s1", ModelFamily::Lr, 0.4),
            row("s1", ModelFamily::Lgb, 0.2),
            row("s3", ModelFamily::Lgb, 0.7),
        ]);
        assert_eq!(pivot.sample_ids, vec!["s1".to_string(), "s3".to_string()]);
        assert_eq!(pivot.models, vec![ModelFamily::Lgb, ModelFamily::Lr]);
        assert_abs_diff_eq!(pivot.scores[[0, 0]], 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(pivot.scores[[0, 1]], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(pivot.scores[[1, 0]], 0.8, epsilon = 1e-12);
        assert_eq!(pivot.scores[[1, 1]], 0.0);
    }

    #[test]
    fn zscore_uses_sample_standard_deviation() {
        let z = batch_zscore(array![1.0, 2.0, 3.0].view());
        // mean 2, sample std 1.
        assert_abs_diff_eq!(z[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[2], 1.0, epsilon = 1e-12);

        let z = batch_zscore(array![0.3].view());
        assert!(z[0].is_nan());
        assert_eq!(batch_zscore(Array1::<f64>::zeros(0).view()).len(), 0);
    }

    #[test]
    fn zscore_statistics_skip_missing_scores() {
        let z = batch_zscore(array![0.1, f64::NAN, 0.5, 0.7].view());
        // Over [0.1, 0.5, 0.7]: mean 13/30, sample std sqrt(31/300).
        let mean = 13.0 / 30.0;
        let std = (31.0_f64 / 300.0).sqrt();
        assert_abs_diff_eq!(z[0], (0.1 - mean) / std, epsilon = 1e-12);
        assert!(z[1].is_nan());
        assert_abs_diff_eq!(z[2], (0.5 - mean) / std, epsilon = 1e-12);
        assert_abs_diff_eq!(z[3], (0.7 - mean) / std, epsilon = 1e-12);

        let z = batch_zscore(array![f64::NAN, 0.4, f64::NAN].view());
        assert!(z.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn zscore_of_constant_column_is_nan() {
        let z = batch_zscore(array![0.5, 0.5, 0.5].view());
        assert!(z.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn meta_frame_left_joins_categories() {
        let pivot = pivot_scores(&[
            row("a", ModelFamily::Lgb, 0.1),
            row("a", ModelFamily::Lr, 0.2),
            row("b", ModelFamily::Lgb, 0.3),
            row("b", ModelFamily::Lr, 0.6),
        ]);
        let categories = FeatureFrame {
            sample_ids: vec!["b".into()],
            numeric_names: Vec::new(),
            numeric: Array2::zeros((1, 0)),
            categorical_names: vec![columns::H_SPECIES.into(), columns::ORDER.into()],
            categorical: vec![vec![Some("Homo sapiens".into())], vec![Some("Primates".into())]],
        };
        let frame = build_meta_frame(&pivot, &categories);

        assert_eq!(frame.numeric_names, vec!["LightGBM", "LogisticRegression"]);
        assert_abs_diff_eq!(
            frame.numeric[[0, 0]],
            -std::f64::consts::FRAC_1_SQRT_2,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            frame.numeric[[1, 1]],
            std::f64::consts::FRAC_1_SQRT_2,
            epsilon = 1e-12
        );
        assert_eq!(frame.categorical_column(columns::H_SPECIES).unwrap()[0], None);
        assert_eq!(
            frame.categorical_column(columns::ORDER).unwrap()[1].as_deref(),
            Some("Primates")
        );
    }

    #[test]
    fn stacking_layer_guards_with_its_own_vocabulary() {
        let bundle = bundle();
        let predictions = predict_meta_fold(
            &bundle,
            2,
            &matrix(),
            &strings(&["MX1"]),
            &base_rows([0.1, 0.5, 0.3]),
        )
        .unwrap();

        let ids: Vec<&str> = predictions.iter().map(|p| p.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(predictions.iter().all(|p| p.family == ModelFamily::Meta));

        // a: known to the stacking encoder.
        assert_abs_diff_eq!(predictions[0].score, 0.5, epsilon = 1e-12);
        assert_eq!(predictions[0].label, PredictionLabel::Negative);
        // b: Mus musculus and Rodentia are first-layer categories only.
        assert_abs_diff_eq!(predictions[1].score, sigmoid(3.0), epsilon = 1e-12);
        assert_eq!(predictions[1].label, PredictionLabel::Positive);
        // c: no category row after the missing-value filter.
        assert_abs_diff_eq!(predictions[2].score, sigmoid(3.0), epsilon = 1e-12);
    }

    #[test]
    fn missing_first_layer_score_only_drops_its_sample() {
        let bundle = bundle();
        let predictions = predict_meta_fold(
            &bundle,
            0,
            &matrix(),
            &strings(&["MX1"]),
            &base_rows([0.1, f64::NAN, 0.3]),
        )
        .unwrap();

        let ids: Vec<&str> = predictions.iter().map(|p| p.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
