use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the serialized form of a fitted first- or second-layer
// classifier. The `kind` tag selects the variant at load time.

/// LightGBM treats any magnitude at or below this as zero when routing
/// `missing_type = zero` splits.
const ZERO_THRESHOLD: f64 = 1e-35;

/// How a split routes values the booster considered missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingType {
    /// NaN is read as 0.0 and compared against the threshold.
    #[default]
    None,
    /// Values indistinguishable from zero follow the default branch.
    Zero,
    /// NaN follows the default branch.
    Nan,
}

/// A node of one regression tree. Split features index into the owning
/// ensemble's `feature_names`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        #[serde(default)]
        missing_type: MissingType,
        #[serde(default)]
        default_left: bool,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    /// Walks the tree for one feature row and returns the leaf value.
    pub fn evaluate(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = self;
        loop {
            match node {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    missing_type,
                    default_left,
                    left,
                    right,
                } => {
                    let mut value = row[*feature];
                    if value.is_nan() && *missing_type != MissingType::Nan {
                        value = 0.0;
                    }
                    let use_default = match missing_type {
                        MissingType::Zero => value.abs() <= ZERO_THRESHOLD,
                        MissingType::Nan => value.is_nan(),
                        MissingType::None => false,
                    };
                    let go_left = if use_default {
                        *default_left
                    } else {
                        value <= *threshold
                    };
                    node = if go_left { left } else { right };
                }
            }
        }
    }

    fn max_feature_index(&self) -> Option<usize> {
        match self {
            TreeNode::Leaf { .. } => None,
            TreeNode::Split {
                feature,
                left,
                right,
                ..
            } => [Some(*feature), left.max_feature_index(), right.max_feature_index()]
                .into_iter()
                .flatten()
                .max(),
        }
    }
}

fn default_sigmoid() -> f64 {
    1.0
}

/// A binary-objective gradient-boosted tree ensemble. Leaf values already
/// include shrinkage, so the raw score is `init_score + Σ tree(x)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub feature_names: Vec<String>,
    pub trees: Vec<TreeNode>,
    #[serde(default)]
    pub init_score: f64,
    /// Slope of the output sigmoid (LightGBM's `sigmoid` objective parameter).
    #[serde(default = "default_sigmoid")]
    pub sigmoid: f64,
}

impl TreeEnsemble {
    pub fn raw_score(&self, features: ArrayView1<f64>) -> f64 {
        self.init_score
            + self
                .trees
                .iter()
                .map(|tree| tree.evaluate(features))
                .sum::<f64>()
    }
}

/// Binary logistic regression: `P(y = 1) = σ(x · w + b)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub feature_names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

/// The top-level, self-contained fitted classifier artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedModel {
    GradientBoosting(TreeEnsemble),
    Logistic(LogisticModel),
}

/// Custom error type for model loading and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse JSON model file: {0}")]
    JsonParseError(#[from] serde_json::Error),
    #[error("Model artifact is inconsistent: {0}")]
    InvalidArtifact(String),
    #[error(
        "The model expects feature '{0}', but it is not present in the prediction data. The artifact and the input gene vocabulary do not match."
    )]
    MissingFeature(String),
}

/// A classifier that maps one ordered feature row to P(y = 1).
pub trait ProbabilityModel {
    /// Names of the features in the order `predict_probability` expects them.
    fn feature_names(&self) -> &[String];

    fn predict_probability(&self, features: ArrayView1<f64>) -> f64;

    /// Scores every row of `matrix`, whose columns are named by
    /// `column_names`. Columns are picked by name, so their order in the
    /// matrix does not have to match the training order.
    fn predict_matrix(
        &self,
        column_names: &[String],
        matrix: ArrayView2<f64>,
    ) -> Result<Array1<f64>, ModelError> {
        let layout = resolve_layout(self.feature_names(), column_names)?;
        let mut row_buffer = Array1::<f64>::zeros(layout.len());
        let scores: Array1<f64> = matrix
            .axis_iter(Axis(0))
            .map(|row| {
                for (slot, &source) in layout.iter().enumerate() {
                    row_buffer[slot] = row[source];
                }
                self.predict_probability(row_buffer.view())
            })
            .collect();
        Ok(scores)
    }
}

#[inline]
fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + f64::exp(-x))
}

impl ProbabilityModel for TreeEnsemble {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_probability(&self, features: ArrayView1<f64>) -> f64 {
        logistic(self.sigmoid * self.raw_score(features))
    }
}

impl ProbabilityModel for LogisticModel {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_probability(&self, features: ArrayView1<f64>) -> f64 {
        let eta: f64 = features
            .iter()
            .zip(&self.coefficients)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.intercept;
        logistic(eta)
    }
}

impl ProbabilityModel for FittedModel {
    fn feature_names(&self) -> &[String] {
        match self {
            FittedModel::GradientBoosting(model) => model.feature_names(),
            FittedModel::Logistic(model) => model.feature_names(),
        }
    }

    fn predict_probability(&self, features: ArrayView1<f64>) -> f64 {
        match self {
            FittedModel::GradientBoosting(model) => model.predict_probability(features),
            FittedModel::Logistic(model) => model.predict_probability(features),
        }
    }
}

impl FittedModel {
    /// Loads a fitted model from its JSON document and checks its shape.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let reader = BufReader::new(File::open(path)?);
        let model: FittedModel = serde_json::from_reader(reader)?;
        model.validate()?;
        Ok(model)
    }

    /// Confirms every index and coefficient refers to a declared feature.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            FittedModel::GradientBoosting(model) => {
                let n_features = model.feature_names.len();
                for (tree_idx, tree) in model.trees.iter().enumerate() {
                    if let Some(max_idx) = tree.max_feature_index() {
                        if max_idx >= n_features {
                            return Err(ModelError::InvalidArtifact(format!(
                                "tree {tree_idx} splits on feature index {max_idx}, but only {n_features} features are declared"
                            )));
                        }
                    }
                }
            }
            FittedModel::Logistic(model) => {
                if model.coefficients.len() != model.feature_names.len() {
                    return Err(ModelError::InvalidArtifact(format!(
                        "{} coefficients for {} declared features",
                        model.coefficients.len(),
                        model.feature_names.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Maps each expected feature to its column position in the prediction data.
fn resolve_layout(expected: &[String], available: &[String]) -> Result<Vec<usize>, ModelError> {
    let positions: ahash::AHashMap<&str, usize> = available
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();

    expected
        .iter()
        .map(|name| {
            positions
                .get(name.as_str())
                .copied()
                .ok_or_else(|| ModelError::MissingFeature(name.clone()))
        })
        .collect()
}
