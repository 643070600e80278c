//! Header reconciliation: maps whatever columns a source ships to the
//! canonical field set.
//!
//! Matching is exact against an ordered alias list after both sides are
//! reduced to lower-case alphanumerics. There is no substring or edit
//! distance pass, so the same headers always resolve the same way.

use std::collections::BTreeMap;

use crate::models::Field;
use crate::table::RawTable;

pub const ID_PREFIX: &str = "L";
pub const ID_WIDTH: usize = 10;

#[derive(Debug, Clone)]
pub struct AliasTable {
    aliases: BTreeMap<Field, Vec<String>>,
}

impl AliasTable {
    pub fn aliases(&self, field: Field) -> &[String] {
        self.aliases.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the index of the first header matching `field`, trying
    /// aliases in list order, along with the alias that fired.
    pub fn find(&self, field: Field, headers: &[String]) -> Option<(usize, &str)> {
        let keys: Vec<String> = headers.iter().map(|h| header_key(h)).collect();
        for alias in self.aliases(field) {
            let wanted = header_key(alias);
            if wanted.is_empty() {
                continue;
            }
            if let Some(index) = keys.iter().position(|key| *key == wanted) {
                return Some((index, alias.as_str()));
            }
        }
        None
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert(
            Field::LearnerId,
            list(&["learner_id", "student_id", "user_id", "id", "sid", "uid"]),
        );
        aliases.insert(
            Field::TimeSpent,
            list(&[
                "time_spent",
                "time_spent_min",
                "time",
                "minutes_spent",
                "study_time",
                "total_time",
                "duration_min",
                "minutes",
                "time_minutes",
                "duration",
            ]),
        );
        aliases.insert(
            Field::AvgScore,
            list(&[
                "avg_score",
                "score",
                "mean_score",
                "average_score",
                "avg_marks",
                "percentage",
                "percent",
                "overall_score",
            ]),
        );
        aliases.insert(
            Field::Accuracy,
            list(&[
                "accuracy",
                "acc",
                "correct_rate",
                "precision",
                "acc_pct",
                "correct_percentage",
            ]),
        );
        aliases.insert(
            Field::DifficultyLevel,
            list(&["difficulty_level", "difficulty", "level", "diff_level"]),
        );
        // Completion and mastery columns stand in for topic progress, after
        // any native spelling.
        aliases.insert(
            Field::TopicProgress,
            list(&[
                "topic_progress",
                "topic_pct",
                "progress_topic",
                "completion",
                "progress",
                "pct_complete",
                "completion_pct",
                "mastery",
                "mastery_score",
                "mastery_pct",
            ]),
        );
        Self { aliases }
    }
}

fn list(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn header_key(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Canonical view of one raw table. Every row has a learner id; other
/// fields are present only when a header matched.
#[derive(Debug, Clone, Default)]
pub struct ReconciledTable {
    pub learner_ids: Vec<String>,
    pub columns: BTreeMap<Field, Vec<Option<String>>>,
    pub matched_headers: BTreeMap<Field, String>,
    pub synthesized_ids: usize,
}

/// Holds the id counter so synthesized ids stay unique across every chunk
/// reconciled in one run.
#[derive(Debug, Clone)]
pub struct SchemaReconciler {
    aliases: AliasTable,
    next_id: u64,
}

impl SchemaReconciler {
    pub fn new(aliases: AliasTable) -> Self {
        Self { aliases, next_id: 1 }
    }

    pub fn reconcile(&mut self, raw: &RawTable) -> ReconciledTable {
        let mut table = ReconciledTable::default();

        for field in Field::ALL {
            let Some((index, alias)) = self.aliases.find(field, &raw.headers) else {
                tracing::debug!(%field, "no header matched, field left absent");
                continue;
            };
            let header = raw.headers[index].clone();
            tracing::debug!(%field, header = %header, alias, "header matched alias");
            let values = raw
                .rows
                .iter()
                .map(|row| {
                    row.get(index)
                        .map(|cell| cell.trim())
                        .filter(|cell| !cell.is_empty())
                        .map(str::to_string)
                })
                .collect();
            table.columns.insert(field, values);
            table.matched_headers.insert(field, header);
        }

        let ids = table.columns.remove(&Field::LearnerId);
        let mut synthesized = 0usize;
        table.learner_ids = match ids {
            Some(values) => values
                .into_iter()
                .map(|value| {
                    value.unwrap_or_else(|| {
                        synthesized += 1;
                        self.next_learner_id()
                    })
                })
                .collect(),
            None => {
                synthesized = raw.rows.len();
                (0..raw.rows.len()).map(|_| self.next_learner_id()).collect()
            }
        };
        table.synthesized_ids = synthesized;

        if synthesized > 0 {
            tracing::info!(synthesized, "synthesized learner ids");
        }
        table
    }

    fn next_learner_id(&mut self) -> String {
        let id = format!("{ID_PREFIX}{:0width$}", self.next_id, width = ID_WIDTH);
        self.next_id += 1;
        id
    }
}

impl Default for SchemaReconciler {
    fn default() -> Self {
        Self::new(AliasTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn header_key_strips_punctuation_and_case() {
        assert_eq!(header_key("Duration(min)"), "durationmin");
        assert_eq!(header_key(" Student_ID "), "studentid");
        assert_eq!(header_key("acc-pct%"), "accpct");
    }

    #[test]
    fn matches_headers_through_aliases() {
        let table = raw(
            &["StudentID", "Score", "Duration(min)", "Unrelated"],
            &[&["s1", "80", "30"], &["s2", "90", ""]],
        );
        let reconciled = SchemaReconciler::default().reconcile(&table);
        assert_eq!(reconciled.learner_ids, vec!["s1", "s2"]);
        assert_eq!(
            reconciled.columns.get(&Field::AvgScore).unwrap(),
            &[Some("80".to_string()), Some("90".to_string())]
        );
        assert_eq!(
            reconciled.columns.get(&Field::TimeSpent).unwrap(),
            &[Some("30".to_string()), None]
        );
        assert!(reconciled.columns.get(&Field::Accuracy).is_none());
        assert_eq!(reconciled.matched_headers[&Field::TimeSpent], "Duration(min)");
    }

    #[test]
    fn first_alias_in_list_order_wins() {
        // "score" precedes "percentage" in the avg_score aliases, whatever
        // the header order.
        let table = raw(&["percentage", "score"], &[&["55", "0.7"]]);
        let reconciled = SchemaReconciler::default().reconcile(&table);
        assert_eq!(reconciled.matched_headers[&Field::AvgScore], "score");
    }

    #[test]
    fn native_topic_progress_beats_completion() {
        let table = raw(&["completion", "Topic Progress"], &[&["0.1", "0.9"]]);
        let reconciled = SchemaReconciler::default().reconcile(&table);
        assert_eq!(
            reconciled.matched_headers[&Field::TopicProgress],
            "Topic Progress"
        );
    }

    #[test]
    fn no_substring_matching() {
        let table = raw(&["final_score_value"], &[&["10"]]);
        let reconciled = SchemaReconciler::default().reconcile(&table);
        assert!(reconciled.columns.get(&Field::AvgScore).is_none());
    }

    #[test]
    fn synthesizes_ids_unique_across_calls() {
        let mut reconciler = SchemaReconciler::default();
        let first = reconciler.reconcile(&raw(&["score"], &[&["1"], &["2"]]));
        let second = reconciler.reconcile(&raw(&["score"], &[&["3"]]));
        assert_eq!(first.learner_ids, vec!["L0000000001", "L0000000002"]);
        assert_eq!(second.learner_ids, vec!["L0000000003"]);
        assert_eq!(first.synthesized_ids, 2);
    }

    #[test]
    fn blank_id_cells_get_synthesized_ids() {
        let table = raw(&["learner_id"], &[&["a"], &[" "], &["c"]]);
        let reconciled = SchemaReconciler::default().reconcile(&table);
        assert_eq!(reconciled.learner_ids, vec!["a", "L0000000001", "c"]);
        assert_eq!(reconciled.synthesized_ids, 1);
    }
}
