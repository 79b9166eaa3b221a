//! # First-Layer Prediction
//!
//! Runs the tree ensemble and the logistic model of one fold on the fold's
//! normalized features. The same scoring routine is reused by the stacking
//! layer, only the numeric features differ.

use crate::artifacts::{ArtifactError, ModelArtifactBundle};
use crate::encoder::{CategoricalEncoder, EncodeError};
use crate::model::{FittedModel, ModelError, ProbabilityModel};
use crate::normalizer::TransformError;
use crate::types::{FeatureFrame, FoldPrediction, ModelFamily, PredictionLabel, SampleFeatureMatrix};
use ndarray::{Axis, ShapeError, concatenate};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Feature transformation failed: {0}")]
    Transform(#[from] TransformError),
    #[error("Categorical encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("Model evaluation failed: {0}")]
    Model(#[from] ModelError),
    #[error("Encoded features do not line up with the numeric features: {0}")]
    Shape(#[from] ShapeError),
}

/// Everything needed to score one model family of one fold.
#[derive(Debug, Clone, Copy)]
pub struct FamilyPredictor<'a> {
    pub family: ModelFamily,
    pub fold: usize,
    pub encoder: &'a CategoricalEncoder,
    pub model: &'a FittedModel,
    pub threshold: f64,
}

impl<'a> FamilyPredictor<'a> {
    pub fn from_bundle(
        bundle: &'a ModelArtifactBundle,
        family: ModelFamily,
        fold: usize,
    ) -> Result<Self, ArtifactError> {
        Ok(Self {
            family,
            fold,
            encoder: bundle.encoder(family, fold)?,
            model: bundle.model(family, fold)?,
            threshold: bundle.threshold(family, fold)?,
        })
    }

    /// Guards and encodes the categorical columns, appends them to the
    /// numeric ones, drops rows with a NaN feature and scores the rest.
    /// The returned predictions follow the frame's row order.
    pub fn predict(&self, frame: &FeatureFrame) -> Result<Vec<FoldPrediction>, PredictError> {
        let guarded = self.encoder.guard(frame)?;
        let encoded = self.encoder.transform(&guarded)?;

        let mut feature_names = guarded.numeric_names.clone();
        feature_names.extend(self.encoder.feature_names());
        let features = concatenate(Axis(1), &[guarded.numeric.view(), encoded.view()])?;

        let dropped: Vec<bool> = features
            .axis_iter(Axis(0))
            .map(|row| row.iter().any(|v| v.is_nan()))
            .collect();
        let n_dropped = dropped.iter().filter(|&&d| d).count();
        if n_dropped > 0 {
            log::debug!(
                "Fold {}: {} of {} samples have missing {} features and are not scored",
                self.fold,
                n_dropped,
                frame.n_rows(),
                self.family.model_name()
            );
        }

        let kept_rows: Vec<usize> = dropped
            .iter()
            .enumerate()
            .filter_map(|(idx, &d)| (!d).then_some(idx))
            .collect();
        let kept = features.select(Axis(0), &kept_rows);
        let scores = self.model.predict_matrix(&feature_names, kept.view())?;

        Ok(kept_rows
            .iter()
            .zip(scores.iter())
            .map(|(&row, &score)| FoldPrediction {
                sample_id: guarded.sample_ids[row].clone(),
                family: self.family,
                score,
                label: PredictionLabel::from_score(score, self.threshold),
            })
            .collect())
    }
}

/// Scores every sample with both first-layer models of `fold`. Tree ensemble
/// rows come first, then logistic rows.
pub fn predict_base_fold(
    bundle: &ModelArtifactBundle,
    fold: usize,
    matrix: &SampleFeatureMatrix,
    gene_vocabulary: &[String],
) -> Result<Vec<FoldPrediction>, PredictError> {
    let frame = bundle.normalizer(fold)?.transform(matrix, gene_vocabulary)?;

    let mut predictions = Vec::with_capacity(frame.n_rows() * ModelFamily::BASE.len());
    for family in ModelFamily::BASE {
        let predictor = FamilyPredictor::from_bundle(bundle, family, fold)?;
        predictions.extend(predictor.predict(&frame)?);
    }
    Ok(predictions)
}
