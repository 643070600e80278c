use std::fmt;

use serde::{Deserialize, Serialize};

/// The six attributes every learner record is reconciled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    LearnerId,
    TimeSpent,
    AvgScore,
    Accuracy,
    DifficultyLevel,
    TopicProgress,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::LearnerId,
        Field::TimeSpent,
        Field::AvgScore,
        Field::Accuracy,
        Field::DifficultyLevel,
        Field::TopicProgress,
    ];

    /// Numeric fields in the order the imputer fills them. Derived synthetic
    /// rules for `time_spent` and `topic_progress` read the earlier ones.
    pub const IMPUTE_ORDER: [Field; 5] = [
        Field::AvgScore,
        Field::Accuracy,
        Field::DifficultyLevel,
        Field::TimeSpent,
        Field::TopicProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::LearnerId => "learner_id",
            Field::TimeSpent => "time_spent",
            Field::AvgScore => "avg_score",
            Field::Accuracy => "accuracy",
            Field::DifficultyLevel => "difficulty_level",
            Field::TopicProgress => "topic_progress",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub learner_id: String,
    pub time_spent: f64,
    pub avg_score: f64,
    pub accuracy: f64,
    pub difficulty_level: i64,
    pub topic_progress: f64,
}

impl CanonicalRecord {
    pub fn value(&self, field: Field) -> Option<f64> {
        match field {
            Field::LearnerId => None,
            Field::TimeSpent => Some(self.time_spent),
            Field::AvgScore => Some(self.avg_score),
            Field::Accuracy => Some(self.accuracy),
            Field::DifficultyLevel => Some(self.difficulty_level as f64),
            Field::TopicProgress => Some(self.topic_progress),
        }
    }

    pub fn to_query(&self) -> LearnerQuery {
        LearnerQuery {
            time_spent: self.time_spent,
            avg_score: self.avg_score,
            accuracy: self.accuracy,
            difficulty_level: self.difficulty_level,
        }
    }
}

/// Single-row request accepted by the recommend surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearnerQuery {
    pub time_spent: f64,
    pub avg_score: f64,
    pub accuracy: f64,
    pub difficulty_level: i64,
}

impl LearnerQuery {
    /// Reads a score or accuracy above 1 as a percentage, so `85` and
    /// `0.85` land on the same canonical fraction.
    pub fn to_fractions(self) -> Self {
        Self {
            avg_score: percent_to_fraction(self.avg_score),
            accuracy: percent_to_fraction(self.accuracy),
            ..self
        }
    }
}

fn percent_to_fraction(value: f64) -> f64 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub cluster: usize,
    pub next_difficulty: i64,
    pub topics: Vec<String>,
    pub tips: Vec<String>,
}

/// Cluster output for one row. `cluster` is the hard label when a hard
/// model is loaded, otherwise the soft model's label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusterPrediction {
    pub cluster: usize,
    pub hard_cluster: Option<usize>,
    pub soft_cluster: Option<usize>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSize {
    pub cluster: usize,
    pub count: usize,
    pub avg_confidence: Option<f64>,
}
