//! # Model Artifact Store
//!
//! Loads every fitted object of the five-fold ensemble from one directory:
//!
//! | File | Content |
//! |---|---|
//! | `normalizer_{fold}.toml` | fold feature normalizer |
//! | `encoder_{family}_{fold}.toml` | one-hot encoder with frozen vocabularies |
//! | `final_model_{family}_{fold}.json` | fitted classifier |
//! | `thresholds_{family}.npy` | per-fold decision thresholds, 1-D float64 |
//!
//! The bundle is immutable after loading and is shared by reference with the
//! fold workers.

use crate::encoder::{CategoricalEncoder, EncodeError};
use crate::model::{FittedModel, ModelError};
use crate::normalizer::{FoldNormalizer, TransformError};
use crate::types::{ModelFamily, N_FOLDS};
use ndarray::Array1;
use ndarray_npy::{ReadNpyError, read_npy};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error(
        "{} model artifact file(s) are missing:\n{}",
        .0.len(),
        .0.iter().map(|p| format!("  {}", p.display())).collect::<Vec<_>>().join("\n")
    )]
    MissingArtifacts(Vec<PathBuf>),
    #[error("Fold index {fold} is out of range; the ensemble has folds 0 to {}.", .n_folds - 1)]
    InvalidFold { fold: usize, n_folds: usize },
    #[error("{what} covers {found} fold(s), expected {expected}.")]
    FoldCount {
        what: String,
        found: usize,
        expected: usize,
    },
    #[error("Threshold file '{path}' holds {found} values, expected one per fold ({expected}).")]
    ThresholdLength {
        path: PathBuf,
        found: usize,
        expected: usize,
    },
    #[error("Failed to read threshold file '{path}': {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("Failed to load model '{path}': {source}")]
    Model {
        path: PathBuf,
        #[source]
        source: ModelError,
    },
    #[error("Failed to load encoder '{path}': {source}")]
    Encoder {
        path: PathBuf,
        #[source]
        source: EncodeError,
    },
    #[error("Failed to load normalizer '{path}': {source}")]
    Normalizer {
        path: PathBuf,
        #[source]
        source: TransformError,
    },
}

/// File names of the bundle. Kept public so fixtures and tools agree with the
/// loader on the layout.
pub mod paths {
    use super::*;

    pub fn normalizer(dir: &Path, fold: usize) -> PathBuf {
        dir.join(format!("normalizer_{fold}.toml"))
    }

    pub fn encoder(dir: &Path, family: ModelFamily, fold: usize) -> PathBuf {
        dir.join(format!("encoder_{}_{fold}.toml", family.file_tag()))
    }

    pub fn model(dir: &Path, family: ModelFamily, fold: usize) -> PathBuf {
        dir.join(format!("final_model_{}_{fold}.json", family.file_tag()))
    }

    pub fn thresholds(dir: &Path, family: ModelFamily) -> PathBuf {
        dir.join(format!("thresholds_{}.npy", family.file_tag()))
    }

    /// Every file the bundle needs, in load order.
    pub fn expected(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::with_capacity(N_FOLDS * 7 + 3);
        for fold in 0..N_FOLDS {
            files.push(normalizer(dir, fold));
            for family in ModelFamily::ALL {
                files.push(encoder(dir, family, fold));
                files.push(model(dir, family, fold));
            }
        }
        for family in ModelFamily::ALL {
            files.push(thresholds(dir, family));
        }
        files
    }
}

/// The fitted objects of one fold and family.
#[derive(Debug, Clone)]
struct FamilyArtifacts {
    encoder: CategoricalEncoder,
    model: FittedModel,
}

/// Every fitted object of the ensemble, indexed by fold and family.
#[derive(Debug, Clone)]
pub struct ModelArtifactBundle {
    normalizers: Vec<FoldNormalizer>,
    families: Vec<BTreeMap<ModelFamily, FamilyArtifacts>>,
    thresholds: BTreeMap<ModelFamily, Array1<f64>>,
}

impl ModelArtifactBundle {
    /// Loads and validates the whole bundle. All file paths are checked
    /// before any is parsed, and every absent one is reported.
    pub fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let missing: Vec<PathBuf> = paths::expected(dir)
            .into_iter()
            .filter(|path| !path.is_file())
            .collect();
        if !missing.is_empty() {
            return Err(ArtifactError::MissingArtifacts(missing));
        }

        let mut normalizers = Vec::with_capacity(N_FOLDS);
        let mut families = Vec::with_capacity(N_FOLDS);
        for fold in 0..N_FOLDS {
            let path = paths::normalizer(dir, fold);
            let normalizer = FoldNormalizer::load(&path)
                .map_err(|source| ArtifactError::Normalizer { path, source })?;
            normalizers.push(normalizer);

            let mut by_family = BTreeMap::new();
            for family in ModelFamily::ALL {
                let path = paths::encoder(dir, family, fold);
                let encoder = CategoricalEncoder::load(&path)
                    .map_err(|source| ArtifactError::Encoder { path, source })?;
                let path = paths::model(dir, family, fold);
                let model = FittedModel::load(&path)
                    .map_err(|source| ArtifactError::Model { path, source })?;
                by_family.insert(family, FamilyArtifacts { encoder, model });
            }
            families.push(by_family);
        }

        let mut thresholds = BTreeMap::new();
        for family in ModelFamily::ALL {
            let path = paths::thresholds(dir, family);
            let values: Array1<f64> = match read_npy(&path) {
                Ok(values) => values,
                Err(source) => return Err(ArtifactError::Npy { path, source }),
            };
            if values.len() != N_FOLDS {
                return Err(ArtifactError::ThresholdLength {
                    path,
                    found: values.len(),
                    expected: N_FOLDS,
                });
            }
            thresholds.insert(family, values);
        }

        log::info!(
            "Loaded model artifacts for {N_FOLDS} folds and {} model families from '{}'",
            ModelFamily::ALL.len(),
            dir.display()
        );
        Ok(Self {
            normalizers,
            families,
            thresholds,
        })
    }

    /// Assembles a bundle from already-built parts. Every vector is indexed by
    /// fold and must hold `N_FOLDS` entries.
    pub fn from_parts(
        normalizers: Vec<FoldNormalizer>,
        encoders: BTreeMap<ModelFamily, Vec<CategoricalEncoder>>,
        models: BTreeMap<ModelFamily, Vec<FittedModel>>,
        thresholds: BTreeMap<ModelFamily, Array1<f64>>,
    ) -> Result<Self, ArtifactError> {
        let check_count = |what: String, found: usize| {
            if found == N_FOLDS {
                Ok(())
            } else {
                Err(ArtifactError::FoldCount {
                    what,
                    found,
                    expected: N_FOLDS,
                })
            }
        };
        check_count("The normalizer list".to_string(), normalizers.len())?;

        let mut families: Vec<BTreeMap<ModelFamily, FamilyArtifacts>> =
            (0..N_FOLDS).map(|_| BTreeMap::new()).collect();
        for family in ModelFamily::ALL {
            let family_encoders = encoders.get(&family).map_or(&[][..], Vec::as_slice);
            let family_models = models.get(&family).map_or(&[][..], Vec::as_slice);
            check_count(format!("The {family} encoder list"), family_encoders.len())?;
            check_count(format!("The {family} model list"), family_models.len())?;
            check_count(
                format!("The {family} threshold vector"),
                thresholds.get(&family).map_or(0, Array1::len),
            )?;

            for (fold, slot) in families.iter_mut().enumerate() {
                slot.insert(
                    family,
                    FamilyArtifacts {
                        encoder: family_encoders[fold].clone(),
                        model: family_models[fold].clone(),
                    },
                );
            }
        }

        Ok(Self {
            normalizers,
            families,
            thresholds,
        })
    }

    fn check_fold(fold: usize) -> Result<(), ArtifactError> {
        if fold >= N_FOLDS {
            return Err(ArtifactError::InvalidFold {
                fold,
                n_folds: N_FOLDS,
            });
        }
        Ok(())
    }

    fn family(&self, family: ModelFamily, fold: usize) -> Result<&FamilyArtifacts, ArtifactError> {
        Self::check_fold(fold)?;
        self.families[fold]
            .get(&family)
            .ok_or(ArtifactError::InvalidFold {
                fold,
                n_folds: N_FOLDS,
            })
    }

    pub fn model(&self, family: ModelFamily, fold: usize) -> Result<&FittedModel, ArtifactError> {
        Ok(&self.family(family, fold)?.model)
    }

    pub fn encoder(
        &self,
        family: ModelFamily,
        fold: usize,
    ) -> Result<&CategoricalEncoder, ArtifactError> {
        Ok(&self.family(family, fold)?.encoder)
    }

    pub fn normalizer(&self, fold: usize) -> Result<&FoldNormalizer, ArtifactError> {
        Self::check_fold(fold)?;
        Ok(&self.normalizers[fold])
    }

    pub fn threshold(&self, family: ModelFamily, fold: usize) -> Result<f64, ArtifactError> {
        Self::check_fold(fold)?;
        Ok(self.thresholds(family)[fold])
    }

    /// The full per-fold threshold vector of a family.
    pub fn thresholds(&self, family: ModelFamily) -> &Array1<f64> {
        // Every family is inserted by both constructors.
        &self.thresholds[&family]
    }
}
