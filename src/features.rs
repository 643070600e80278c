//! Deterministic encoding of canonical columns into a feature matrix.
//!
//! `fit` derives the column selection from the frame it is given and
//! persists it together with the scaling parameters and categorical
//! vocabularies. `transform` replays exactly that selection and order; a
//! frame missing a recorded column is rejected so the matrix width can never
//! drift from what the cluster models were trained on.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactStore, ENCODER, FEATURE_SPEC};
use crate::config::FeatureCandidates;
use crate::error::{PipelineError, Result};
use crate::models::{CanonicalRecord, Field, LearnerQuery};

pub const UNKNOWN_CATEGORY: &str = "__unknown__";

/// Named columns ready for encoding. A field may be exposed both as a
/// number and as a categorical label.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    rows: usize,
    numeric: BTreeMap<String, Vec<f64>>,
    categorical: BTreeMap<String, Vec<String>>,
}

impl Frame {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn with_numeric(mut self, name: &str, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), self.rows);
        self.numeric.insert(name.to_string(), values);
        self
    }

    pub fn with_categorical(mut self, name: &str, values: Vec<String>) -> Self {
        debug_assert_eq!(values.len(), self.rows);
        self.categorical.insert(name.to_string(), values);
        self
    }

    pub fn from_records(records: &[CanonicalRecord]) -> Self {
        let mut frame = Self::new(records.len());
        for field in Field::ALL {
            if field == Field::LearnerId {
                continue;
            }
            let values = records.iter().filter_map(|r| r.value(field)).collect();
            frame = frame.with_numeric(field.as_str(), values);
        }
        let levels = records
            .iter()
            .map(|r| r.difficulty_level.to_string())
            .collect();
        frame.with_categorical(Field::DifficultyLevel.as_str(), levels)
    }

    pub fn from_query(query: &LearnerQuery) -> Self {
        Self::new(1)
            .with_numeric(Field::TimeSpent.as_str(), vec![query.time_spent])
            .with_numeric(Field::AvgScore.as_str(), vec![query.avg_score])
            .with_numeric(Field::Accuracy.as_str(), vec![query.accuracy])
            .with_numeric(
                Field::DifficultyLevel.as_str(),
                vec![query.difficulty_level as f64],
            )
            .with_categorical(
                Field::DifficultyLevel.as_str(),
                vec![query.difficulty_level.to_string()],
            )
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Row-major numeric matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    width: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn new(width: usize, data: Vec<f64>) -> Self {
        debug_assert!(width == 0 || data.len() % width == 0);
        Self { width, data }
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        Self::new(width, rows.iter().flatten().copied().collect())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.width..(index + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.data.chunks_exact(self.width.max(1))
    }

    /// Splits into consecutive matrices of at most `size` rows.
    pub fn chunks(&self, size: usize) -> Vec<FeatureMatrix> {
        self.data
            .chunks(size.max(1) * self.width.max(1))
            .map(|chunk| FeatureMatrix::new(self.width, chunk.to_vec()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnScaler {
    pub mean: f64,
    pub scale: f64,
}

impl ColumnScaler {
    fn fit(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                scale: 1.0,
            };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        Self {
            mean,
            scale: if std > f64::EPSILON { std } else { 1.0 },
        }
    }

    fn apply(&self, value: f64) -> f64 {
        (value - self.mean) / self.scale
    }
}

/// Scaling parameters and vocabularies in FeatureSpec order. Each
/// categorical column encodes to its sorted vocabulary plus one trailing
/// unknown slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedEncoder {
    pub scalers: Vec<ColumnScaler>,
    pub vocabularies: Vec<Vec<String>>,
}

impl FittedEncoder {
    pub fn width(&self) -> usize {
        self.scalers.len() + self.vocabularies.iter().map(|v| v.len() + 1).sum::<usize>()
    }

    pub fn feature_names(&self, spec: &FeatureSpec) -> Vec<String> {
        let mut names = spec.numeric.clone();
        for (column, vocabulary) in spec.categorical.iter().zip(&self.vocabularies) {
            for value in vocabulary {
                names.push(format!("{column}={value}"));
            }
            names.push(format!("{column}={UNKNOWN_CATEGORY}"));
        }
        names
    }
}

#[derive(Debug, Clone)]
enum EncoderState {
    Unfit,
    Fitted {
        spec: FeatureSpec,
        encoder: FittedEncoder,
    },
}

pub struct FeaturePipeline {
    candidates: FeatureCandidates,
    store: ArtifactStore,
    state: EncoderState,
}

impl FeaturePipeline {
    pub fn new(candidates: FeatureCandidates, store: ArtifactStore) -> Self {
        Self {
            candidates,
            store,
            state: EncoderState::Unfit,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, EncoderState::Fitted { .. })
    }

    /// Re-derives the column selection from the frame and overwrites any
    /// persisted one.
    pub fn fit(&mut self, frame: &Frame) -> Result<&FeatureSpec> {
        if frame.rows() == 0 {
            return Err(PipelineError::EmptyInput);
        }
        let spec = FeatureSpec {
            numeric: self
                .candidates
                .numeric
                .iter()
                .filter(|c| frame.numeric.contains_key(*c))
                .cloned()
                .collect(),
            categorical: self
                .candidates
                .categorical
                .iter()
                .filter(|c| frame.categorical.contains_key(*c))
                .cloned()
                .collect(),
        };
        let encoder = FittedEncoder {
            scalers: spec
                .numeric
                .iter()
                .map(|c| ColumnScaler::fit(&frame.numeric[c]))
                .collect(),
            vocabularies: spec
                .categorical
                .iter()
                .map(|c| {
                    frame.categorical[c]
                        .iter()
                        .cloned()
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect()
                })
                .collect(),
        };

        self.store.save(FEATURE_SPEC, &spec)?;
        self.store.save(ENCODER, &encoder)?;
        tracing::info!(
            numeric = ?spec.numeric,
            categorical = ?spec.categorical,
            width = encoder.width(),
            "feature encoder fitted"
        );
        self.state = EncoderState::Fitted { spec, encoder };
        self.spec()
    }

    pub fn fit_transform(&mut self, frame: &Frame) -> Result<FeatureMatrix> {
        self.fit(frame)?;
        self.transform(frame)
    }

    pub fn transform(&mut self, frame: &Frame) -> Result<FeatureMatrix> {
        let (spec, encoder) = self.ensure_loaded()?;

        let numeric: Vec<&Vec<f64>> = spec
            .numeric
            .iter()
            .map(|c| {
                frame
                    .numeric
                    .get(c)
                    .ok_or_else(|| PipelineError::SchemaMismatch { column: c.clone() })
            })
            .collect::<Result<_>>()?;
        let categorical: Vec<&Vec<String>> = spec
            .categorical
            .iter()
            .map(|c| {
                frame
                    .categorical
                    .get(c)
                    .ok_or_else(|| PipelineError::SchemaMismatch { column: c.clone() })
            })
            .collect::<Result<_>>()?;

        let width = encoder.width();
        let mut data = Vec::with_capacity(width * frame.rows());
        for row in 0..frame.rows() {
            for (column, scaler) in numeric.iter().zip(&encoder.scalers) {
                data.push(scaler.apply(column[row]));
            }
            for (column, vocabulary) in categorical.iter().zip(&encoder.vocabularies) {
                let slot = vocabulary
                    .binary_search(&column[row])
                    .unwrap_or(vocabulary.len());
                for index in 0..=vocabulary.len() {
                    data.push(if index == slot { 1.0 } else { 0.0 });
                }
            }
        }
        Ok(FeatureMatrix::new(width, data))
    }

    pub fn spec(&mut self) -> Result<&FeatureSpec> {
        Ok(self.ensure_loaded()?.0)
    }

    pub fn feature_names(&mut self) -> Result<Vec<String>> {
        let (spec, encoder) = self.ensure_loaded()?;
        Ok(encoder.feature_names(spec))
    }

    fn ensure_loaded(&mut self) -> Result<(&FeatureSpec, &FittedEncoder)> {
        if let EncoderState::Unfit = self.state {
            let spec: Option<FeatureSpec> = self.store.load(FEATURE_SPEC)?;
            let encoder: Option<FittedEncoder> = self.store.load(ENCODER)?;
            match (spec, encoder) {
                (Some(spec), Some(encoder)) => {
                    self.state = EncoderState::Fitted { spec, encoder };
                }
                _ => {
                    return Err(PipelineError::MissingArtifact {
                        artifact: "feature encoder",
                    })
                }
            }
        }
        match &self.state {
            EncoderState::Fitted { spec, encoder } => Ok((spec, encoder)),
            EncoderState::Unfit => Err(PipelineError::MissingArtifact {
                artifact: "feature encoder",
            }),
        }
    }
}
