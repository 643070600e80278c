use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::UpsertSummary;
use crate::impute::ImputationReport;
use crate::models::{ClusterPrediction, ClusterSize, Field};
use crate::quality::QualityMetrics;

pub const SUMMARY_FILE: &str = "clustering_summary.json";
pub const REPORT_FILE: &str = "clustering_report.md";
pub const CLUSTERS_FILE: &str = "learner_clusters.csv";
pub const RECOMMENDATIONS_FILE: &str = "batch_recommendations.csv";
pub const IMPUTATION_FILE: &str = "imputation_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    WholeTable,
    Streaming,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusteringSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub mode: FitMode,
    pub rows: usize,
    pub feature_names: Vec<String>,
    pub cluster_sizes: Vec<ClusterSize>,
    pub imputation: ImputationReport,
    pub quality: Option<QualityMetrics>,
    pub artifacts: BTreeMap<String, PathBuf>,
    pub store: Option<UpsertSummary>,
}

impl ClusteringSummary {
    pub fn new(mode: FitMode, feature_names: Vec<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            mode,
            rows: 0,
            feature_names,
            cluster_sizes: Vec::new(),
            imputation: ImputationReport::default(),
            quality: None,
            artifacts: BTreeMap::new(),
            store: None,
        }
    }
}

/// Running per-cluster counts, fed one prediction batch at a time.
#[derive(Debug, Default)]
pub struct ClusterTally {
    counts: BTreeMap<usize, (usize, f64, usize)>,
}

impl ClusterTally {
    pub fn add(&mut self, predictions: &[ClusterPrediction]) {
        for prediction in predictions {
            let entry = self.counts.entry(prediction.cluster).or_insert((0, 0.0, 0));
            entry.0 += 1;
            if let Some(confidence) = prediction.confidence {
                entry.1 += confidence;
                entry.2 += 1;
            }
        }
    }

    pub fn total(&self) -> usize {
        self.counts.values().map(|(count, _, _)| count).sum()
    }

    /// Largest clusters first; ties keep cluster order.
    pub fn sizes(&self) -> Vec<ClusterSize> {
        let mut sizes: Vec<ClusterSize> = self
            .counts
            .iter()
            .map(|(&cluster, &(count, confidence, scored))| ClusterSize {
                cluster,
                count,
                avg_confidence: (scored > 0).then(|| confidence / scored as f64),
            })
            .collect();
        sizes.sort_by(|a, b| b.count.cmp(&a.count));
        sizes
    }
}

pub fn build_report(summary: &ClusteringSummary, centroids: Option<&[Vec<f64>]>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Learner Clustering Report");
    let _ = writeln!(
        output,
        "Run {} generated {} ({} rows, {})",
        summary.run_id,
        summary.generated_at.format("%Y-%m-%d %H:%M UTC"),
        summary.rows,
        match summary.mode {
            FitMode::WholeTable => "whole table",
            FitMode::Streaming => "streaming",
        }
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cluster Sizes");

    if summary.cluster_sizes.is_empty() {
        let _ = writeln!(output, "No learners were clustered.");
    } else {
        for size in summary.cluster_sizes.iter() {
            let share = if summary.rows == 0 {
                0.0
            } else {
                100.0 * size.count as f64 / summary.rows as f64
            };
            match size.avg_confidence {
                Some(confidence) => {
                    let _ = writeln!(
                        output,
                        "- cluster {}: {} learners ({:.1}%), avg confidence {:.2}",
                        size.cluster, size.count, share, confidence
                    );
                }
                None => {
                    let _ = writeln!(
                        output,
                        "- cluster {}: {} learners ({:.1}%)",
                        size.cluster, size.count, share
                    );
                }
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Centroids");

    match centroids {
        Some(centroids) if !centroids.is_empty() => {
            let _ = writeln!(output, "| cluster | {} |", summary.feature_names.join(" | "));
            let _ = writeln!(
                output,
                "|---|{}",
                "---|".repeat(summary.feature_names.len())
            );
            for (cluster, centre) in centroids.iter().enumerate() {
                let cells: Vec<String> = centre.iter().map(|v| format!("{v:.3}")).collect();
                let _ = writeln!(output, "| {} | {} |", cluster, cells.join(" | "));
            }
        }
        _ => {
            let _ = writeln!(output, "No cluster model available.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Imputation");
    let _ = writeln!(
        output,
        "{} real rows, {} synthetic rows",
        summary.imputation.real_rows, summary.imputation.synthetic_rows
    );
    for field in Field::IMPUTE_ORDER {
        let filled = summary.imputation.filled(field);
        if filled > 0 {
            let _ = writeln!(output, "- {}: {} values filled", field, filled);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Quality");

    match &summary.quality {
        Some(quality) => {
            let _ = writeln!(
                output,
                "Scored on {} of {} rows across {} clusters",
                quality.sampled, quality.rows, quality.clusters
            );
            for (name, value) in [
                ("silhouette", quality.silhouette),
                ("davies_bouldin", quality.davies_bouldin),
                ("calinski_harabasz", quality.calinski_harabasz),
                ("inertia", quality.inertia),
            ] {
                match value {
                    Some(value) => {
                        let _ = writeln!(output, "- {name}: {value:.4}");
                    }
                    None => {
                        let _ = writeln!(output, "- {name}: n/a");
                    }
                }
            }
        }
        None => {
            let _ = writeln!(output, "Quality metrics were not computed.");
        }
    }

    if let Some(store) = &summary.store {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Store");
        let _ = writeln!(
            output,
            "{} learners upserted in {} batches, {} batches failed",
            store.written, store.batches, store.failed_batches
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(cluster: usize, confidence: Option<f64>) -> ClusterPrediction {
        ClusterPrediction {
            cluster,
            hard_cluster: Some(cluster),
            soft_cluster: confidence.map(|_| cluster),
            confidence,
        }
    }

    fn summarize_clusters(predictions: &[ClusterPrediction]) -> Vec<ClusterSize> {
        let mut tally = ClusterTally::default();
        tally.add(predictions);
        tally.sizes()
    }

    #[test]
    fn sizes_are_sorted_by_count() {
        let sizes = summarize_clusters(&[
            prediction(0, Some(0.5)),
            prediction(1, Some(0.9)),
            prediction(1, Some(0.7)),
        ]);
        assert_eq!(sizes[0].cluster, 1);
        assert_eq!(sizes[0].count, 2);
        assert!((sizes[0].avg_confidence.unwrap() - 0.8).abs() < 1e-12);
        assert_eq!(sizes[1].count, 1);
    }

    #[test]
    fn tally_accumulates_across_batches() {
        let mut tally = ClusterTally::default();
        tally.add(&[prediction(2, None)]);
        tally.add(&[prediction(2, None), prediction(0, None)]);
        assert_eq!(tally.total(), 3);
        let sizes = tally.sizes();
        assert_eq!(sizes[0].cluster, 2);
        assert!(sizes[0].avg_confidence.is_none());
    }

    #[test]
    fn report_tolerates_missing_models_and_metrics() {
        let summary = ClusteringSummary::new(FitMode::WholeTable, Vec::new());
        let report = build_report(&summary, None);
        assert!(report.contains("No learners were clustered."));
        assert!(report.contains("No cluster model available."));
        assert!(report.contains("Quality metrics were not computed."));
        assert!(!report.contains("## Store"));
    }

    #[test]
    fn report_lists_centroids_and_sizes() {
        let mut summary =
            ClusteringSummary::new(FitMode::Streaming, vec!["a".to_string(), "b".to_string()]);
        summary.rows = 4;
        summary.cluster_sizes = summarize_clusters(&[
            prediction(0, Some(1.0)),
            prediction(0, Some(1.0)),
            prediction(1, Some(1.0)),
            prediction(1, Some(1.0)),
        ]);
        let centroids = vec![vec![0.0, 1.0], vec![2.0, 3.0]];
        let report = build_report(&summary, Some(centroids.as_slice()));
        assert!(report.contains("streaming"));
        assert!(report.contains("| cluster | a | b |"));
        assert!(report.contains("| 1 | 2.000 | 3.000 |"));
        assert!(report.contains("- cluster 0: 2 learners (50.0%), avg confidence 1.00"));
    }
}
