//! Orchestration of the fit and predict runs over CSV inputs.
//!
//! Every run canonicalizes raw rows through the same three stages
//! (reconcile, normalize, impute) before anything is encoded. Fit runs are
//! the only writers of the artifact directory.

use std::collections::BTreeMap;
use std::fs::File;
use std::iter::{Flatten, Peekable};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::artifacts::{ArtifactStore, CENTROIDS, ENCODER, FEATURE_SPEC, HARD_MODEL, SOFT_MODEL};
use crate::cluster::{ClusterAssigner, Reservoir};
use crate::config::AppConfig;
use crate::db::{LearnerDocument, LearnerStore, UpsertBuffer};
use crate::error::{PipelineError, Result};
use crate::features::{FeatureMatrix, FeaturePipeline, Frame};
use crate::impute::{ImputationReport, Imputer};
use crate::models::{CanonicalRecord, ClusterPrediction, LearnerQuery, Recommendation};
use crate::normalize::{NormalizedTable, ValueNormalizer};
use crate::quality::QualityMetrics;
use crate::recommend::{RecommendationPolicy, TopicCatalog};
use crate::report::{
    self, ClusterTally, ClusteringSummary, FitMode, CLUSTERS_FILE, IMPUTATION_FILE,
    RECOMMENDATIONS_FILE, REPORT_FILE, SUMMARY_FILE,
};
use crate::schema::SchemaReconciler;
use crate::table::{self, RawChunks, RawTable};

/// Reconcile, normalize and impute in one step. The reconciler's id
/// counter persists across calls, so one canonicalizer should serve one
/// run, however many sources it reads.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    reconciler: SchemaReconciler,
    normalizer: ValueNormalizer,
    imputer: Imputer,
}

impl Canonicalizer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            reconciler: SchemaReconciler::default(),
            normalizer: ValueNormalizer::new(config.difficulty_levels),
            imputer: Imputer::new(config.difficulty_levels, &config.imputation),
        }
    }

    /// Scoring runs never pad the input with synthetic learners.
    pub fn without_synthesis(mut self) -> Self {
        self.imputer = self.imputer.with_min_rows(0);
        self
    }

    pub fn canonicalize(
        &mut self,
        raw: &RawTable,
        seed: u64,
    ) -> (Vec<CanonicalRecord>, ImputationReport) {
        self.canonicalize_many(std::slice::from_ref(raw), seed)
    }

    /// Each source is reconciled and scaled on its own; the stacked table is
    /// imputed once, so the row floor applies to the combined total.
    pub fn canonicalize_many(
        &mut self,
        raws: &[RawTable],
        seed: u64,
    ) -> (Vec<CanonicalRecord>, ImputationReport) {
        let mut combined = NormalizedTable::default();
        for raw in raws {
            combined.append(self.normalize(raw));
        }
        self.imputer.impute(combined, seed)
    }

    fn normalize(&mut self, raw: &RawTable) -> NormalizedTable {
        let reconciled = self.reconciler.reconcile(raw);
        tracing::debug!(
            rows = reconciled.learner_ids.len(),
            matched = reconciled.matched_headers.len(),
            "source reconciled"
        );
        self.normalizer.normalize_table(&reconciled)
    }

    fn canonicalize_chunk(
        &mut self,
        raw: &RawTable,
        seed: u64,
        synthesize: bool,
    ) -> (Vec<CanonicalRecord>, ImputationReport) {
        if synthesize {
            return self.canonicalize(raw, seed);
        }
        let normalized = self.normalize(raw);
        self.imputer.clone().with_min_rows(0).impute(normalized, seed)
    }
}

/// Canonical chunks of one or more CSV files, read in order. A chunk never
/// spans two files. Chunk `i` is imputed with seed `seed + i`; the
/// synthesis floor applies only when the whole input fits in one chunk.
/// Two readers over the same files yield identical rows.
pub struct CanonicalChunks {
    chunks: Peekable<Flatten<std::vec::IntoIter<RawChunks<File>>>>,
    canonicalizer: Canonicalizer,
    seed: u64,
    index: u64,
}

impl CanonicalChunks {
    pub fn open(paths: &[PathBuf], chunk_size: usize, config: &AppConfig) -> Result<Self> {
        let sources = paths
            .iter()
            .map(|path| RawChunks::open(path, chunk_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chunks: sources.into_iter().flatten().peekable(),
            canonicalizer: Canonicalizer::new(config),
            seed: config.training.random_state,
            index: 0,
        })
    }
}

impl Iterator for CanonicalChunks {
    type Item = Result<(Vec<CanonicalRecord>, ImputationReport)>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.chunks.next()? {
            Ok(raw) => raw,
            Err(err) => return Some(Err(err)),
        };
        let synthesize = self.index == 0 && self.chunks.peek().is_none();
        let seed = self.seed.wrapping_add(self.index);
        self.index += 1;
        Some(Ok(self.canonicalizer.canonicalize_chunk(&raw, seed, synthesize)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamingOptions {
    pub chunk_size: usize,
    pub sample_cap: usize,
}

#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    pub rows: usize,
    pub imputation: ImputationReport,
    pub canonical_path: PathBuf,
    pub report_path: PathBuf,
}

pub struct Pipeline {
    config: AppConfig,
    artifacts: ArtifactStore,
    features: FeaturePipeline,
    clusters: ClusterAssigner,
    policy: RecommendationPolicy,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        let artifacts = ArtifactStore::new(&config.paths.artifacts);
        let catalog = TopicCatalog::load(&config.paths.knowledge)?;
        Ok(Self {
            features: FeaturePipeline::new(config.features.clone(), artifacts.clone()),
            clusters: ClusterAssigner::new(&config.training, artifacts.clone()),
            policy: RecommendationPolicy::new(config.max_level(), catalog),
            artifacts,
            config,
        })
    }

    fn seed(&self) -> u64 {
        self.config.training.random_state
    }

    fn report_path(&self, name: &str) -> PathBuf {
        self.config.paths.reports.join(name)
    }

    fn read_sources(&self, csvs: &[PathBuf]) -> Result<Vec<RawTable>> {
        if csvs.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        csvs.iter()
            .map(|path| {
                let raw = table::read_raw_table(path)?;
                if raw.is_empty() {
                    tracing::warn!(path = %path.display(), "source has no data rows");
                } else {
                    tracing::info!(path = %path.display(), rows = raw.len(), "source read");
                }
                Ok(raw)
            })
            .collect()
    }

    /// Combines every source into one canonical table written to `out`,
    /// with the imputation report next to it.
    pub fn normalize_csv(&self, csvs: &[PathBuf], out: &Path) -> Result<NormalizeOutcome> {
        let raws = self.read_sources(csvs)?;
        let (records, imputation) =
            Canonicalizer::new(&self.config).canonicalize_many(&raws, self.seed());

        let mut writer = table::create_writer(out)?;
        table::write_canonical(&mut writer, &records)?;
        writer.flush().map_err(|e| PipelineError::io(out, e))?;

        let report_path = out
            .parent()
            .map(|parent| parent.join(IMPUTATION_FILE))
            .unwrap_or_else(|| PathBuf::from(IMPUTATION_FILE));
        let body = serde_json::to_vec_pretty(&imputation)?;
        std::fs::write(&report_path, body).map_err(|e| PipelineError::io(&report_path, e))?;

        tracing::info!(rows = records.len(), out = %out.display(), "canonical table written");
        Ok(NormalizeOutcome {
            rows: records.len(),
            imputation,
            canonical_path: out.to_path_buf(),
            report_path,
        })
    }

    /// Fits the encoder and both cluster models on the combined table, then
    /// labels every row. Only rows read from the sources reach the store.
    pub async fn fit_table<S: LearnerStore>(
        &mut self,
        csvs: &[PathBuf],
        sink: Option<&mut UpsertBuffer<'_, S>>,
    ) -> Result<ClusteringSummary> {
        let raws = self.read_sources(csvs)?;
        let (records, imputation) =
            Canonicalizer::new(&self.config).canonicalize_many(&raws, self.seed());
        if records.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        tracing::info!(rows = records.len(), "canonical table ready");

        let matrix = self.features.fit_transform(&Frame::from_records(&records))?;
        self.clusters.fit(&matrix)?;
        let predictions = self.clusters.predict(&matrix)?;

        let clusters_path = self.report_path(CLUSTERS_FILE);
        let mut writer = table::create_writer(&clusters_path)?;
        table::write_clustered(&mut writer, &records, &predictions)?;
        writer
            .flush()
            .map_err(|e| PipelineError::io(&clusters_path, e))?;

        if let Some(buffer) = sink {
            buffer
                .extend(documents(&records, &predictions, imputation.real_rows))
                .await;
        }

        let labels: Vec<usize> = predictions.iter().map(|p| p.cluster).collect();
        let quality = self.quality_of(&matrix, &labels, self.config.training.quality_sample)?;

        let mut tally = ClusterTally::default();
        tally.add(&predictions);
        self.summarize(FitMode::WholeTable, tally, imputation, quality)
    }

    /// Two passes over the input: the first fits the encoder on the first
    /// chunk, updates the online k-means on every chunk and feeds the
    /// reservoir the mixture is fit on; the second re-reads the files and
    /// labels them chunk by chunk.
    pub async fn fit_streaming<S: LearnerStore>(
        &mut self,
        csvs: &[PathBuf],
        options: StreamingOptions,
        mut sink: Option<&mut UpsertBuffer<'_, S>>,
    ) -> Result<ClusteringSummary> {
        let mut imputation = ImputationReport::default();
        self.clusters.begin_streaming(options.sample_cap);
        for (index, chunk) in CanonicalChunks::open(csvs, options.chunk_size, &self.config)?.enumerate() {
            let (records, report) = chunk?;
            let frame = Frame::from_records(&records);
            if index == 0 {
                self.features.fit(&frame)?;
            }
            let matrix = self.features.transform(&frame)?;
            self.clusters.feed_chunk(&matrix)?;
            imputation.merge(report);
            tracing::info!(chunk = index, rows = records.len(), "pass one chunk fitted");
        }
        self.clusters.finish_streaming()?;

        let clusters_path = self.report_path(CLUSTERS_FILE);
        let mut writer = table::create_writer(&clusters_path)?;
        let mut tally = ClusterTally::default();
        let mut sample = Reservoir::new(self.config.training.quality_sample.max(1), self.seed());
        for (index, chunk) in CanonicalChunks::open(csvs, options.chunk_size, &self.config)?.enumerate() {
            let (records, report) = chunk?;
            let matrix = self.features.transform(&Frame::from_records(&records))?;
            let predictions = self.clusters.predict(&matrix)?;
            table::write_clustered(&mut writer, &records, &predictions)?;
            tally.add(&predictions);
            for (row, prediction) in matrix.rows().zip(&predictions) {
                sample.offer((row.to_vec(), prediction.cluster));
            }
            if let Some(buffer) = sink.as_mut() {
                buffer
                    .extend(documents(&records, &predictions, report.real_rows))
                    .await;
            }
            tracing::info!(chunk = index, rows = records.len(), "pass two chunk labelled");
        }
        writer
            .flush()
            .map_err(|e| PipelineError::io(&clusters_path, e))?;

        let (rows, labels): (Vec<Vec<f64>>, Vec<usize>) = sample.into_items().into_iter().unzip();
        let mut quality = self.quality_of(&FeatureMatrix::from_rows(&rows), &labels, 0)?;
        quality.rows = tally.total();
        self.summarize(FitMode::Streaming, tally, imputation, quality)
    }

    fn quality_of(
        &mut self,
        matrix: &FeatureMatrix,
        labels: &[usize],
        sample: usize,
    ) -> Result<QualityMetrics> {
        let inertia = self
            .clusters
            .models()?
            .hard
            .as_ref()
            .map(|model| model.inertia(matrix));
        Ok(QualityMetrics::compute(matrix, labels, sample, self.seed()).with_inertia(inertia))
    }

    fn summarize(
        &mut self,
        mode: FitMode,
        tally: ClusterTally,
        imputation: ImputationReport,
        quality: QualityMetrics,
    ) -> Result<ClusteringSummary> {
        let feature_names = self.features.feature_names()?;
        self.clusters.write_centroids(&feature_names)?;

        let mut summary = ClusteringSummary::new(mode, feature_names);
        summary.rows = tally.total();
        summary.cluster_sizes = tally.sizes();
        summary.imputation = imputation;
        summary.quality = Some(quality);

        let mut artifacts = BTreeMap::new();
        for name in [FEATURE_SPEC, ENCODER, HARD_MODEL, SOFT_MODEL, CENTROIDS] {
            if self.artifacts.exists(name) {
                artifacts.insert(name.to_string(), self.artifacts.path(name));
            }
        }
        artifacts.insert(CLUSTERS_FILE.to_string(), self.report_path(CLUSTERS_FILE));
        summary.artifacts = artifacts;

        tracing::info!(
            run_id = %summary.run_id,
            rows = summary.rows,
            clusters = summary.cluster_sizes.len(),
            "fit run complete"
        );
        Ok(summary)
    }

    /// Writes `clustering_summary.json` and `clustering_report.md`.
    pub fn write_run_reports(&mut self, summary: &ClusteringSummary) -> Result<(PathBuf, PathBuf)> {
        let reports = &self.config.paths.reports;
        std::fs::create_dir_all(reports).map_err(|e| PipelineError::io(reports, e))?;

        let summary_path = self.report_path(SUMMARY_FILE);
        let body = serde_json::to_vec_pretty(summary)?;
        std::fs::write(&summary_path, body).map_err(|e| PipelineError::io(&summary_path, e))?;

        let report_path = self.report_path(REPORT_FILE);
        let centroids = self.clusters.models()?.centroids();
        let markdown = report::build_report(summary, centroids);
        std::fs::write(&report_path, markdown).map_err(|e| PipelineError::io(&report_path, e))?;

        Ok((summary_path, report_path))
    }

    pub fn predict_records(&mut self, records: &[CanonicalRecord]) -> Result<Vec<ClusterPrediction>> {
        let matrix = self.features.transform(&Frame::from_records(records))?;
        self.clusters.predict(&matrix)
    }

    pub fn recommend_one(&mut self, query: &LearnerQuery) -> Result<Recommendation> {
        let matrix = self
            .features
            .transform(&Frame::from_query(&query.to_fractions()))?;
        let prediction = self
            .clusters
            .predict(&matrix)?
            .into_iter()
            .next()
            .ok_or(PipelineError::EmptyInput)?;
        Ok(self.policy.recommend(query, prediction.cluster))
    }

    /// One batched prediction, then the per-row policy. Returns the number
    /// of rows written.
    pub fn recommend_csv(&mut self, csv: &Path, out: Option<&Path>) -> Result<(usize, PathBuf)> {
        let raw = table::read_raw_table(csv)?;
        let (records, _) = Canonicalizer::new(&self.config)
            .without_synthesis()
            .canonicalize(&raw, self.seed());
        let predictions = self.predict_records(&records)?;
        let recommendations = self.policy.recommend_all(&records, &predictions);

        let path = out
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.report_path(RECOMMENDATIONS_FILE));
        let mut writer = table::create_writer(&path)?;
        table::write_recommended(&mut writer, &records, &recommendations)?;
        writer.flush().map_err(|e| PipelineError::io(&path, e))?;
        tracing::info!(rows = records.len(), out = %path.display(), "batch recommendations written");
        Ok((records.len(), path))
    }

    pub fn quality_csv(&mut self, csv: &Path, sample: Option<usize>) -> Result<QualityMetrics> {
        let raw = table::read_raw_table(csv)?;
        let (records, _) = Canonicalizer::new(&self.config)
            .without_synthesis()
            .canonicalize(&raw, self.seed());
        let matrix = self.features.transform(&Frame::from_records(&records))?;
        let labels: Vec<usize> = self
            .clusters
            .predict(&matrix)?
            .iter()
            .map(|p| p.cluster)
            .collect();
        let sample = sample.unwrap_or(self.config.training.quality_sample);
        self.quality_of(&matrix, &labels, sample)
    }
}

/// Store documents for the real rows only. Synthetic padding sits after
/// them and never reaches the store.
fn documents<'a>(
    records: &'a [CanonicalRecord],
    predictions: &'a [ClusterPrediction],
    real_rows: usize,
) -> impl Iterator<Item = LearnerDocument> + 'a {
    let now = Utc::now();
    records
        .iter()
        .zip(predictions)
        .take(real_rows)
        .map(move |(record, prediction)| LearnerDocument::new(record, Some(prediction), now))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::PgStore;
    use crate::models::Field;

    #[derive(Default)]
    struct CapturingStore {
        ids: Mutex<Vec<String>>,
    }

    impl LearnerStore for CapturingStore {
        async fn upsert_batch(&self, documents: &[LearnerDocument]) -> anyhow::Result<u64> {
            self.ids
                .lock()
                .unwrap()
                .extend(documents.iter().map(|doc| doc.learner_id.clone()));
            Ok(documents.len() as u64)
        }
    }

    const THREE_LEARNERS: &str = "student_id,score,acc\nA,80,90\nB,40,30\nC,60,55\n";

    fn config(root: &Path, min_rows: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.artifacts = root.join("artifacts");
        config.paths.reports = root.join("reports");
        config.paths.knowledge = root.join("knowledge");
        config.imputation.min_rows = min_rows;
        config.training.n_clusters = 2;
        config
    }

    fn write_csv(root: &Path, name: &str, body: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn learners_csv(rows: usize) -> String {
        let mut body = String::from("student_id,minutes,score,acc,difficulty\n");
        for i in 0..rows {
            let strong = i % 2 == 0;
            let (minutes, score, acc, level) = if strong {
                (55 + i % 5, 90 - i % 3, 92, "hard")
            } else {
                (12 + i % 4, 40 + i % 6, 35, "easy")
            };
            body.push_str(&format!("u{i},{minutes},{score},{acc},{level}\n"));
        }
        body
    }

    #[test]
    fn mixed_headers_are_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(
            dir.path(),
            "raw.csv",
            "StudentID,Score,Duration(min)\nA,80,10\nB,90,\nC,70,20\n",
        );
        let raw = table::read_raw_table(&csv).unwrap();
        let (records, report) =
            Canonicalizer::new(&config(dir.path(), 0)).canonicalize(&raw, 42);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].learner_id, "A");
        let scores: Vec<f64> = records.iter().map(|r| r.avg_score).collect();
        assert_eq!(scores, vec![0.8, 0.9, 0.7]);
        assert!(records[1].time_spent == 10.0 || records[1].time_spent == 20.0);
        assert_eq!(report.filled(Field::TimeSpent), 1);
        for record in &records {
            assert!((0.0..=1.0).contains(&record.accuracy));
            assert!((0.0..=1.0).contains(&record.topic_progress));
            assert!((0..=2).contains(&record.difficulty_level));
        }
    }

    #[test]
    fn canonical_output_is_stable_under_renormalization() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "learners.csv", &learners_csv(12));
        let pipeline = Pipeline::new(config(dir.path(), 0)).unwrap();
        let first = dir.path().join("canonical.csv");
        pipeline.normalize_csv(&[csv], &first).unwrap();
        let second = dir.path().join("again").join("canonical.csv");
        let outcome = pipeline.normalize_csv(&[first.clone()], &second).unwrap();

        assert_eq!(outcome.rows, 12);
        assert!(outcome.report_path.is_file());
        assert_eq!(
            std::fs::read_to_string(&first).unwrap(),
            std::fs::read_to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn whole_table_fit_writes_reports_and_serves_recommendations() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "learners.csv", &learners_csv(40));
        let mut pipeline = Pipeline::new(config(dir.path(), 0)).unwrap();

        let summary = pipeline
            .fit_table::<PgStore>(&[csv.clone()], None)
            .await
            .unwrap();
        assert_eq!(summary.rows, 40);
        assert_eq!(summary.cluster_sizes.len(), 2);
        let (summary_path, report_path) = pipeline.write_run_reports(&summary).unwrap();
        assert!(summary_path.is_file());
        assert!(std::fs::read_to_string(report_path)
            .unwrap()
            .contains("## Cluster Sizes"));
        assert!(dir.path().join("artifacts").join(CENTROIDS).is_file());
        let clustered = std::fs::read_to_string(dir.path().join("reports").join(CLUSTERS_FILE)).unwrap();
        assert_eq!(clustered.lines().count(), 41);

        let mut fresh = Pipeline::new(config(dir.path(), 0)).unwrap();
        let query = LearnerQuery {
            time_spent: 10.0,
            avg_score: 0.9,
            accuracy: 0.95,
            difficulty_level: 1,
        };
        let recommendation = fresh.recommend_one(&query).unwrap();
        assert_eq!(recommendation.next_difficulty, 2);

        let (rows, out) = fresh.recommend_csv(&csv, None).unwrap();
        assert_eq!(rows, 40);
        assert!(out.ends_with(RECOMMENDATIONS_FILE));
    }

    #[tokio::test]
    async fn streaming_fit_labels_every_row_once() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "learners.csv", &learners_csv(50));
        let mut pipeline = Pipeline::new(config(dir.path(), 0)).unwrap();
        let options = StreamingOptions {
            chunk_size: 8,
            sample_cap: 20,
        };

        let summary = pipeline
            .fit_streaming::<PgStore>(&[csv], options, None)
            .await
            .unwrap();
        assert_eq!(summary.mode, FitMode::Streaming);
        assert_eq!(summary.rows, 50);
        assert_eq!(summary.imputation.real_rows, 50);
        let quality = summary.quality.unwrap();
        assert_eq!(quality.rows, 50);
        assert_eq!(quality.sampled, 50.min(AppConfig::default().training.quality_sample));

        let clustered = std::fs::read_to_string(dir.path().join("reports").join(CLUSTERS_FILE)).unwrap();
        let mut lines = clustered.lines();
        assert!(lines.next().unwrap().starts_with("learner_id,"));
        assert_eq!(lines.count(), 50);
    }

    #[test]
    fn chunk_readers_reproduce_identical_rows() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "raw.csv", "score,acc\n80,\n,0.5\n70,0.9\n");
        let config = config(dir.path(), 0);
        let read = || -> Vec<CanonicalRecord> {
            CanonicalChunks::open(std::slice::from_ref(&csv), 2, &config)
                .unwrap()
                .flat_map(|chunk| chunk.unwrap().0)
                .collect()
        };
        let first = read();
        assert_eq!(first.len(), 3);
        assert_eq!(first, read());
        assert_eq!(first[2].learner_id, "L0000000003");
    }

    #[test]
    fn single_chunk_stream_is_padded_to_floor() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "raw.csv", "score\n80\n90\n");
        let records: Vec<CanonicalRecord> = CanonicalChunks::open(&[csv], 10, &config(dir.path(), 5))
            .unwrap()
            .flat_map(|chunk| chunk.unwrap().0)
            .collect();
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn recommend_before_fit_reports_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(config(dir.path(), 0)).unwrap();
        let query = LearnerQuery {
            time_spent: 40.0,
            avg_score: 0.5,
            accuracy: 0.5,
            difficulty_level: 1,
        };
        assert!(matches!(
            pipeline.recommend_one(&query),
            Err(PipelineError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn sources_with_different_headers_combine_into_one_table() {
        let dir = tempfile::tempdir().unwrap();
        let scores = write_csv(dir.path(), "scores.csv", "StudentID,Score\nA,80\nB,90\n");
        let sessions = write_csv(dir.path(), "sessions.csv", "accuracy,minutes\n0.4,30\n0.6,\n");
        let pipeline = Pipeline::new(config(dir.path(), 0)).unwrap();
        let out = dir.path().join("canonical.csv");

        let outcome = pipeline.normalize_csv(&[scores, sessions], &out).unwrap();
        assert_eq!(outcome.rows, 4);
        assert_eq!(outcome.imputation.real_rows, 4);
        assert_eq!(outcome.imputation.filled(Field::AvgScore), 2);
        assert_eq!(outcome.imputation.filled(Field::Accuracy), 2);

        let records: Vec<CanonicalRecord> = csv::Reader::from_path(&out)
            .unwrap()
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.learner_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "L0000000001", "L0000000002"]);
        assert_eq!(records[0].avg_score, 0.8);
        assert_eq!(records[2].accuracy, 0.4);
        assert_eq!(records[3].time_spent, 30.0);
        assert!(records[0].accuracy == 0.4 || records[0].accuracy == 0.6);
    }

    #[test]
    fn chunks_never_span_sources() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_csv(dir.path(), "a.csv", "score\n80\n90\n");
        let second = write_csv(dir.path(), "b.csv", "user_id,acc\nz1,0.3\n");
        let sizes: Vec<usize> = CanonicalChunks::open(&[first, second], 10, &config(dir.path(), 10))
            .unwrap()
            .map(|chunk| chunk.unwrap().0.len())
            .collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn whole_table_fit_stores_only_real_learners() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "few.csv", THREE_LEARNERS);
        let mut pipeline = Pipeline::new(config(dir.path(), 10)).unwrap();
        let store = CapturingStore::default();
        let mut buffer = UpsertBuffer::new(&store, 4);

        let summary = pipeline.fit_table(&[csv], Some(&mut buffer)).await.unwrap();
        let upserts = buffer.finish().await;
        assert_eq!(summary.rows, 10);
        assert_eq!(summary.imputation.synthetic_rows, 7);
        assert_eq!(upserts.written, 3);
        assert_eq!(*store.ids.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn streaming_fit_stores_only_real_learners() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "few.csv", THREE_LEARNERS);
        let mut pipeline = Pipeline::new(config(dir.path(), 10)).unwrap();
        let store = CapturingStore::default();
        let mut buffer = UpsertBuffer::new(&store, 4);
        let options = StreamingOptions {
            chunk_size: 50,
            sample_cap: 20,
        };

        let summary = pipeline
            .fit_streaming(&[csv], options, Some(&mut buffer))
            .await
            .unwrap();
        buffer.finish().await;
        assert_eq!(summary.rows, 10);
        let ids = store.ids.lock().unwrap();
        assert_eq!(*ids, vec!["A", "B", "C"]);
        assert!(ids.iter().all(|id| !id.starts_with('S')));
    }

    #[tokio::test]
    async fn percent_query_clusters_like_its_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "learners.csv", &learners_csv(40));
        let mut pipeline = Pipeline::new(config(dir.path(), 0)).unwrap();
        pipeline.fit_table::<PgStore>(&[csv], None).await.unwrap();

        let fraction = LearnerQuery {
            time_spent: 12.0,
            avg_score: 0.42,
            accuracy: 0.35,
            difficulty_level: 0,
        };
        let percent = LearnerQuery {
            avg_score: 42.0,
            accuracy: 35.0,
            ..fraction
        };
        assert_eq!(
            pipeline.recommend_one(&percent).unwrap(),
            pipeline.recommend_one(&fraction).unwrap()
        );
    }
}
