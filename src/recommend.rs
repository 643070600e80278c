use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::{CanonicalRecord, ClusterPrediction, LearnerQuery, Recommendation};

pub const CATALOG_FILE: &str = "schema.json";
pub const MAX_TOPICS: usize = 3;
pub const MAX_TIPS: usize = 3;

pub const FALLBACK_TOPICS: [&str; 3] = ["core-practice", "review-mistakes", "targeted-quizzes"];

pub const TIP_INCREASE_TIME: &str = "Increase focused practice to ≥30 mins per session.";
pub const TIP_REVIEW_ERRORS: &str = "Review error log; drill weak sub-skills before advancing.";
pub const TIP_ADVANCE_GRADUALLY: &str = "Advance difficulty gradually; keep streaks of 3 passes.";
pub const TIP_STABILIZE: &str = "Stabilize fundamentals; use spaced repetition.";

const PROMOTE_AT: f64 = 0.8;
const DEMOTE_AT: f64 = 0.5;
const REVIEW_BELOW: f64 = 0.7;
const MIN_SESSION_MINUTES: f64 = 30.0;

/// Topics keyed by difficulty level, as stored in `knowledge/schema.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCatalog {
    #[serde(default)]
    pub topics: BTreeMap<String, Vec<String>>,
}

impl Default for TopicCatalog {
    fn default() -> Self {
        let topics = [("0", "foundations"), ("1", "practice"), ("2", "advanced")]
            .into_iter()
            .map(|(level, topic)| (level.to_string(), vec![topic.to_string()]))
            .collect();
        Self { topics }
    }
}

impl TopicCatalog {
    /// Reads `<knowledge_dir>/schema.json`, falling back to the built-in
    /// catalog when the file does not exist.
    pub fn load(knowledge_dir: &Path) -> Result<Self> {
        let path = knowledge_dir.join(CATALOG_FILE);
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "topic catalog not found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn topics_for(&self, level: i64) -> Vec<String> {
        match self.topics.get(&level.to_string()) {
            Some(topics) if !topics.is_empty() => topics.iter().take(MAX_TOPICS).cloned().collect(),
            _ => FALLBACK_TOPICS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecommendationPolicy {
    max_level: i64,
    catalog: TopicCatalog,
}

impl RecommendationPolicy {
    pub fn new(max_level: i64, catalog: TopicCatalog) -> Self {
        Self {
            max_level: max_level.max(0),
            catalog,
        }
    }

    pub fn recommend(&self, query: &LearnerQuery, cluster: usize) -> Recommendation {
        let accuracy = query.to_fractions().accuracy;
        let next_difficulty = self.next_difficulty(query.difficulty_level, accuracy);

        let mut tips = Vec::with_capacity(MAX_TIPS);
        if query.time_spent < MIN_SESSION_MINUTES {
            tips.push(TIP_INCREASE_TIME.to_string());
        }
        if accuracy < REVIEW_BELOW {
            tips.push(TIP_REVIEW_ERRORS.to_string());
        }
        if next_difficulty > query.difficulty_level {
            tips.push(TIP_ADVANCE_GRADUALLY.to_string());
        } else {
            tips.push(TIP_STABILIZE.to_string());
        }
        tips.truncate(MAX_TIPS);

        Recommendation {
            cluster,
            next_difficulty,
            topics: self.catalog.topics_for(next_difficulty),
            tips,
        }
    }

    pub fn next_difficulty(&self, level: i64, accuracy: f64) -> i64 {
        let step = if accuracy >= PROMOTE_AT {
            1
        } else if accuracy <= DEMOTE_AT {
            -1
        } else {
            0
        };
        (level + step).clamp(0, self.max_level)
    }

    /// Applies the policy row by row to an already-predicted batch.
    pub fn recommend_all(
        &self,
        records: &[CanonicalRecord],
        predictions: &[ClusterPrediction],
    ) -> Vec<Recommendation> {
        records
            .iter()
            .zip(predictions)
            .map(|(record, prediction)| self.recommend(&record.to_query(), prediction.cluster))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecommendationPolicy {
        RecommendationPolicy::new(2, TopicCatalog::default())
    }

    fn query(time_spent: f64, accuracy: f64, difficulty_level: i64) -> LearnerQuery {
        LearnerQuery {
            time_spent,
            avg_score: 0.9,
            accuracy,
            difficulty_level,
        }
    }

    #[test]
    fn strong_short_session_advances() {
        let rec = policy().recommend(&query(10.0, 0.95, 1), 2);
        assert_eq!(rec.cluster, 2);
        assert_eq!(rec.next_difficulty, 2);
        assert_eq!(rec.topics, vec!["advanced".to_string()]);
        assert!(rec.tips.contains(&TIP_INCREASE_TIME.to_string()));
        assert!(rec.tips.contains(&TIP_ADVANCE_GRADUALLY.to_string()));
        assert!(!rec.tips.contains(&TIP_REVIEW_ERRORS.to_string()));
    }

    #[test]
    fn thresholds_are_inclusive() {
        let policy = policy();
        assert_eq!(policy.recommend(&query(45.0, 0.5, 1), 0).next_difficulty, 0);
        assert_eq!(policy.recommend(&query(45.0, 0.8, 1), 0).next_difficulty, 2);
        assert_eq!(policy.recommend(&query(45.0, 0.65, 1), 0).next_difficulty, 1);
    }

    #[test]
    fn next_difficulty_is_clamped() {
        let policy = policy();
        assert_eq!(policy.next_difficulty(2, 0.99), 2);
        assert_eq!(policy.next_difficulty(0, 0.1), 0);
    }

    #[test]
    fn percentage_accuracy_is_scaled() {
        let rec = policy().recommend(&query(45.0, 85.0, 0), 1);
        assert_eq!(rec.next_difficulty, 1);
        assert_eq!(rec.tips, vec![TIP_ADVANCE_GRADUALLY.to_string()]);
    }

    #[test]
    fn weak_learner_gets_review_and_stabilize_tips() {
        let rec = policy().recommend(&query(12.0, 0.4, 1), 0);
        assert_eq!(
            rec.tips,
            vec![
                TIP_INCREASE_TIME.to_string(),
                TIP_REVIEW_ERRORS.to_string(),
                TIP_STABILIZE.to_string(),
            ]
        );
        assert_eq!(rec.topics, vec!["foundations".to_string()]);
    }

    #[test]
    fn missing_level_uses_fallback_topics() {
        let mut catalog = TopicCatalog::default();
        catalog.topics.remove("1");
        catalog.topics.insert("2".to_string(), Vec::new());
        let policy = RecommendationPolicy::new(2, catalog);
        let expected: Vec<String> = FALLBACK_TOPICS.iter().map(|t| t.to_string()).collect();
        assert_eq!(policy.recommend(&query(45.0, 0.6, 1), 0).topics, expected);
        assert_eq!(policy.recommend(&query(45.0, 0.9, 1), 0).topics, expected);
    }

    #[test]
    fn catalog_loads_from_knowledge_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CATALOG_FILE),
            r#"{"topics": {"1": ["fractions", "ratios", "decimals", "percent"]}}"#,
        )
        .unwrap();
        let catalog = TopicCatalog::load(dir.path()).unwrap();
        assert_eq!(catalog.topics_for(1), vec!["fractions", "ratios", "decimals"]);
        assert_eq!(catalog.topics_for(0).len(), FALLBACK_TOPICS.len());
    }

    #[test]
    fn absent_catalog_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(TopicCatalog::load(dir.path()).unwrap(), TopicCatalog::default());
    }
}
