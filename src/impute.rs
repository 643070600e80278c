//! Missing-value completion and synthetic augmentation.
//!
//! Given the same seed and input, the imputer always produces the same
//! table. After it runs every canonical field is populated and in range.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::ImputationConfig;
use crate::models::{CanonicalRecord, Field};
use crate::normalize::NormalizedTable;

pub const SYNTHETIC_ID_PREFIX: &str = "S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSource {
    SampledFromObserved,
    ColumnStatistic,
    SyntheticGeneration,
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Fallback {
    Median(f64),
    Mode(i64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldImputation {
    pub filled: usize,
    pub sources: BTreeMap<FillSource, usize>,
    pub fallback: Option<Fallback>,
}

impl FieldImputation {
    fn record(&mut self, source: FillSource, count: usize) {
        if count == 0 {
            return;
        }
        self.filled += count;
        *self.sources.entry(source).or_insert(0) += count;
    }
}

/// Mostly diagnostics. `real_rows` also bounds which rows a fit run
/// writes to the learner store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImputationReport {
    pub real_rows: usize,
    pub synthetic_rows: usize,
    pub fields: BTreeMap<Field, FieldImputation>,
}

impl ImputationReport {
    pub fn merge(&mut self, other: ImputationReport) {
        self.real_rows += other.real_rows;
        self.synthetic_rows += other.synthetic_rows;
        for (field, imputation) in other.fields {
            let entry = self.fields.entry(field).or_default();
            entry.filled += imputation.filled;
            for (source, count) in imputation.sources {
                *entry.sources.entry(source).or_insert(0) += count;
            }
            if entry.fallback.is_none() {
                entry.fallback = imputation.fallback;
            }
        }
    }

    pub fn filled(&self, field: Field) -> usize {
        self.fields.get(&field).map(|f| f.filled).unwrap_or(0)
    }
}

/// How a field is generated when no real observation exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyntheticRule {
    Uniform { low: f64, high: f64 },
    IntegerRange { low: i64, high: i64 },
    /// Minutes grow as accuracy drops and difficulty rises, with uniform
    /// noise, never below five minutes.
    EffortModel,
    /// Weighted blend of score and accuracy.
    ProgressBlend,
}

#[derive(Debug, Clone)]
pub struct Imputer {
    max_level: i64,
    min_rows: usize,
    sample_missing: bool,
    default_difficulty: i64,
}

impl Imputer {
    pub fn new(levels: i64, config: &ImputationConfig) -> Self {
        let max_level = (levels - 1).max(0);
        Self {
            max_level,
            min_rows: config.min_rows,
            sample_missing: config.sample_missing,
            default_difficulty: config.default_difficulty.clamp(0, max_level),
        }
    }

    pub fn with_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn rule(&self, field: Field) -> Option<SyntheticRule> {
        match field {
            Field::LearnerId => None,
            Field::AvgScore | Field::Accuracy => Some(SyntheticRule::Uniform {
                low: 0.2,
                high: 1.0,
            }),
            Field::DifficultyLevel => Some(SyntheticRule::IntegerRange {
                low: 0,
                high: self.max_level,
            }),
            Field::TimeSpent => Some(SyntheticRule::EffortModel),
            Field::TopicProgress => Some(SyntheticRule::ProgressBlend),
        }
    }

    pub fn impute(
        &self,
        mut table: NormalizedTable,
        seed: u64,
    ) -> (Vec<CanonicalRecord>, ImputationReport) {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = table.len();
        let mut report = ImputationReport {
            real_rows: rows,
            ..ImputationReport::default()
        };

        let mut filled: BTreeMap<Field, Vec<f64>> = BTreeMap::new();
        for field in Field::IMPUTE_ORDER {
            let column = table
                .columns
                .remove(&field)
                .unwrap_or_else(|| vec![None; rows]);
            let imputation = report.fields.entry(field).or_default();
            let values = if field == Field::DifficultyLevel {
                self.fill_levels(column, imputation)
            } else {
                self.fill_continuous(field, column, &filled, imputation, &mut rng)
            };
            filled.insert(field, values);
        }

        let mut records: Vec<CanonicalRecord> = table
            .learner_ids
            .into_iter()
            .enumerate()
            .map(|(row, learner_id)| CanonicalRecord {
                learner_id,
                time_spent: filled[&Field::TimeSpent][row].max(0.0),
                avg_score: filled[&Field::AvgScore][row].clamp(0.0, 1.0),
                accuracy: filled[&Field::Accuracy][row].clamp(0.0, 1.0),
                difficulty_level: (filled[&Field::DifficultyLevel][row] as i64)
                    .clamp(0, self.max_level),
                topic_progress: filled[&Field::TopicProgress][row].clamp(0.0, 1.0),
            })
            .collect();

        if rows < self.min_rows {
            let missing = self.min_rows - rows;
            tracing::info!(
                real_rows = rows,
                floor = self.min_rows,
                synthetic = missing,
                "real rows below floor, appending synthetic learners"
            );
            for index in 0..missing {
                records.push(self.synthetic_record(index + 1, &mut rng));
            }
            report.synthetic_rows = missing;
        }

        (records, report)
    }

    fn fill_continuous(
        &self,
        field: Field,
        mut column: Vec<Option<f64>>,
        filled: &BTreeMap<Field, Vec<f64>>,
        imputation: &mut FieldImputation,
        rng: &mut StdRng,
    ) -> Vec<f64> {
        let observed: Vec<f64> = column.iter().flatten().copied().collect();
        if let Some(median) = median(&observed) {
            imputation.fallback = Some(Fallback::Median(median));
        }
        let missing: Vec<usize> = column
            .iter()
            .enumerate()
            .filter_map(|(row, value)| value.is_none().then_some(row))
            .collect();
        if missing.is_empty() {
            return column.into_iter().flatten().collect();
        }

        if self.sample_missing && !observed.is_empty() {
            for &row in &missing {
                column[row] = Some(observed[rng.gen_range(0..observed.len())]);
            }
            imputation.record(FillSource::SampledFromObserved, missing.len());
        } else if let Some(Fallback::Median(median)) = imputation.fallback {
            for &row in &missing {
                column[row] = Some(median);
            }
            imputation.record(FillSource::ColumnStatistic, missing.len());
        } else {
            for &row in &missing {
                let accuracy = filled.get(&Field::Accuracy).map(|c| c[row]);
                let avg_score = filled.get(&Field::AvgScore).map(|c| c[row]);
                let level = filled.get(&Field::DifficultyLevel).map(|c| c[row]);
                column[row] = Some(self.synthesize(field, avg_score, accuracy, level, rng));
            }
            imputation.record(FillSource::SyntheticGeneration, missing.len());
            tracing::info!(%field, rows = missing.len(), "no observed values, synthesized column");
        }

        column.into_iter().map(|v| v.unwrap_or(0.0)).collect()
    }

    fn fill_levels(&self, column: Vec<Option<f64>>, imputation: &mut FieldImputation) -> Vec<f64> {
        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
        for value in column.iter().flatten() {
            *counts.entry(value.round() as i64).or_insert(0) += 1;
        }
        let mut mode: Option<(i64, usize)> = None;
        for (level, count) in counts {
            if mode.map_or(true, |(_, best)| count > best) {
                mode = Some((level, count));
            }
        }
        let missing = column.iter().filter(|v| v.is_none()).count();
        let fill = match mode {
            Some((level, _)) => {
                imputation.fallback = Some(Fallback::Mode(level));
                imputation.record(FillSource::ColumnStatistic, missing);
                level
            }
            None => {
                imputation.record(FillSource::Placeholder, missing);
                self.default_difficulty
            }
        };
        column
            .into_iter()
            .map(|value| value.unwrap_or(fill as f64))
            .collect()
    }

    fn synthesize(
        &self,
        field: Field,
        avg_score: Option<f64>,
        accuracy: Option<f64>,
        level: Option<f64>,
        rng: &mut StdRng,
    ) -> f64 {
        match self.rule(field) {
            Some(SyntheticRule::Uniform { low, high }) => rng.gen_range(low..=high),
            Some(SyntheticRule::IntegerRange { low, high }) => rng.gen_range(low..=high) as f64,
            Some(SyntheticRule::EffortModel) => {
                let accuracy = accuracy.unwrap_or(0.0);
                let level = level.unwrap_or(self.default_difficulty as f64);
                let noise: f64 = rng.gen_range(-8.0..=8.0);
                let minutes = (25.0 + (1.0 - accuracy) * 50.0 + (2.0 * level + 5.0) + noise).max(5.0);
                (minutes * 10.0).round() / 10.0
            }
            Some(SyntheticRule::ProgressBlend) => {
                let blend = 0.6 * avg_score.unwrap_or(0.0) + 0.4 * accuracy.unwrap_or(0.0);
                (blend.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
            }
            None => 0.0,
        }
    }

    fn synthetic_record(&self, index: usize, rng: &mut StdRng) -> CanonicalRecord {
        let avg_score = self.synthesize(Field::AvgScore, None, None, None, rng);
        let accuracy = self.synthesize(Field::Accuracy, None, None, None, rng);
        let level = self.synthesize(Field::DifficultyLevel, None, None, None, rng);
        let time_spent =
            self.synthesize(Field::TimeSpent, Some(avg_score), Some(accuracy), Some(level), rng);
        let topic_progress = self.synthesize(
            Field::TopicProgress,
            Some(avg_score),
            Some(accuracy),
            Some(level),
            rng,
        );
        CanonicalRecord {
            learner_id: format!("{SYNTHETIC_ID_PREFIX}{index:010}"),
            time_spent,
            avg_score,
            accuracy,
            difficulty_level: level as i64,
            topic_progress,
        }
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
