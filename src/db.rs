use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::models::{CanonicalRecord, ClusterPrediction};

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Bind parameters per upserted row.
pub const UPSERT_COLUMNS: usize = 10;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// One learner row as written to `learner_pathways.learners`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnerDocument {
    pub learner_id: String,
    pub time_spent: f64,
    pub avg_score: f64,
    pub accuracy: f64,
    pub difficulty_level: i64,
    pub topic_progress: f64,
    pub cluster_kmeans: Option<i32>,
    pub cluster_gmm: Option<i32>,
    pub gmm_confidence: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl LearnerDocument {
    pub fn new(
        record: &CanonicalRecord,
        prediction: Option<&ClusterPrediction>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let label = |value: Option<usize>| value.and_then(|v| i32::try_from(v).ok());
        Self {
            learner_id: record.learner_id.clone(),
            time_spent: record.time_spent,
            avg_score: record.avg_score,
            accuracy: record.accuracy,
            difficulty_level: record.difficulty_level,
            topic_progress: record.topic_progress,
            cluster_kmeans: label(prediction.and_then(|p| p.hard_cluster)),
            cluster_gmm: label(prediction.and_then(|p| p.soft_cluster)),
            gmm_confidence: prediction.and_then(|p| p.confidence),
            updated_at,
        }
    }
}

/// Keeps the last document for each `learner_id`, in first-seen order.
/// Postgres rejects an `ON CONFLICT DO UPDATE` that touches one key twice.
fn latest_per_learner(documents: &[LearnerDocument]) -> Vec<&LearnerDocument> {
    let mut slots: HashMap<&str, usize> = HashMap::with_capacity(documents.len());
    let mut latest: Vec<&LearnerDocument> = Vec::with_capacity(documents.len());
    for doc in documents {
        match slots.get(doc.learner_id.as_str()) {
            Some(&slot) => latest[slot] = doc,
            None => {
                slots.insert(doc.learner_id.as_str(), latest.len());
                latest.push(doc);
            }
        }
    }
    latest
}

/// Keyed upsert sink. Writing the same `learner_id` twice replaces the
/// earlier row.
#[allow(async_fn_in_trait)]
pub trait LearnerStore {
    async fn upsert_batch(&self, documents: &[LearnerDocument]) -> anyhow::Result<u64>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl LearnerStore for PgStore {
    async fn upsert_batch(&self, documents: &[LearnerDocument]) -> anyhow::Result<u64> {
        if documents.is_empty() {
            return Ok(0);
        }
        let documents = latest_per_learner(documents);
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO learner_pathways.learners \
             (learner_id, time_spent, avg_score, accuracy, difficulty_level, topic_progress, \
             cluster_kmeans, cluster_gmm, gmm_confidence, updated_at) ",
        );
        query.push_values(documents, |mut row, doc| {
            row.push_bind(doc.learner_id.clone())
                .push_bind(doc.time_spent)
                .push_bind(doc.avg_score)
                .push_bind(doc.accuracy)
                .push_bind(doc.difficulty_level)
                .push_bind(doc.topic_progress)
                .push_bind(doc.cluster_kmeans)
                .push_bind(doc.cluster_gmm)
                .push_bind(doc.gmm_confidence)
                .push_bind(doc.updated_at);
        });
        query.push(
            r#"
            ON CONFLICT (learner_id) DO UPDATE
            SET time_spent = EXCLUDED.time_spent,
                avg_score = EXCLUDED.avg_score,
                accuracy = EXCLUDED.accuracy,
                difficulty_level = EXCLUDED.difficulty_level,
                topic_progress = EXCLUDED.topic_progress,
                cluster_kmeans = EXCLUDED.cluster_kmeans,
                cluster_gmm = EXCLUDED.cluster_gmm,
                gmm_confidence = EXCLUDED.gmm_confidence,
                updated_at = EXCLUDED.updated_at
            "#,
        );
        let result = query
            .build()
            .execute(&self.pool)
            .await
            .context("learner upsert failed")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertSummary {
    pub written: u64,
    pub batches: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
}

/// Collects documents and flushes them in fixed-size batches. A failed
/// flush is logged and counted; the documents in it are dropped.
pub struct UpsertBuffer<'a, S: LearnerStore> {
    store: &'a S,
    batch_size: usize,
    pending: Vec<LearnerDocument>,
    summary: UpsertSummary,
}

impl<'a, S: LearnerStore> UpsertBuffer<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            summary: UpsertSummary::default(),
        }
    }

    pub async fn push(&mut self, document: LearnerDocument) {
        self.pending.push(document);
        if self.pending.len() >= self.batch_size {
            self.flush().await;
        }
    }

    pub async fn extend<I>(&mut self, documents: I)
    where
        I: IntoIterator<Item = LearnerDocument>,
    {
        for document in documents {
            self.push(document).await;
        }
    }

    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.summary.batches += 1;
        match self.store.upsert_batch(&batch).await {
            Ok(written) => {
                self.summary.written += written;
                tracing::debug!(rows = batch.len(), written, "upsert batch flushed");
            }
            Err(err) => {
                self.summary.failed_batches += 1;
                self.summary.failed_records += batch.len();
                tracing::warn!(rows = batch.len(), error = %format!("{err:#}"), "upsert batch failed");
            }
        }
    }

    pub async fn finish(mut self) -> UpsertSummary {
        self.flush().await;
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<BTreeMap<String, LearnerDocument>>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl LearnerStore for MemoryStore {
        async fn upsert_batch(&self, documents: &[LearnerDocument]) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock().unwrap();
            for doc in documents {
                rows.insert(doc.learner_id.clone(), doc.clone());
            }
            self.batch_sizes.lock().unwrap().push(documents.len());
            Ok(documents.len() as u64)
        }
    }

    struct FailingStore;

    impl LearnerStore for FailingStore {
        async fn upsert_batch(&self, _documents: &[LearnerDocument]) -> anyhow::Result<u64> {
            anyhow::bail!("connection reset")
        }
    }

    fn document(id: &str, accuracy: f64) -> LearnerDocument {
        let record = CanonicalRecord {
            learner_id: id.to_string(),
            time_spent: 30.0,
            avg_score: 0.7,
            accuracy,
            difficulty_level: 1,
            topic_progress: 0.5,
        };
        let prediction = ClusterPrediction {
            cluster: 1,
            hard_cluster: Some(1),
            soft_cluster: Some(2),
            confidence: Some(0.9),
        };
        LearnerDocument::new(&record, Some(&prediction), Utc::now())
    }

    #[tokio::test]
    async fn buffer_flushes_in_batches() {
        let store = MemoryStore::default();
        let mut buffer = UpsertBuffer::new(&store, 2);
        buffer
            .extend((0..5).map(|i| document(&format!("L{i}"), 0.5)))
            .await;
        let summary = buffer.finish().await;
        assert_eq!(summary.written, 5);
        assert_eq!(summary.batches, 3);
        assert_eq!(*store.batch_sizes.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn repeated_ids_replace_earlier_rows() {
        let store = MemoryStore::default();
        let mut buffer = UpsertBuffer::new(&store, 10);
        buffer.push(document("L1", 0.2)).await;
        buffer.flush().await;
        buffer.push(document("L1", 0.9)).await;
        buffer.finish().await;
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["L1"].accuracy, 0.9);
        assert_eq!(rows["L1"].cluster_gmm, Some(2));
    }

    #[tokio::test]
    async fn failed_flush_is_counted_not_fatal() {
        let mut buffer = UpsertBuffer::new(&FailingStore, 2);
        buffer
            .extend((0..3).map(|i| document(&format!("L{i}"), 0.5)))
            .await;
        let summary = buffer.finish().await;
        assert_eq!(summary.written, 0);
        assert_eq!(summary.failed_batches, 2);
        assert_eq!(summary.failed_records, 3);
    }

    #[test]
    fn batch_keeps_last_document_per_learner() {
        let documents = vec![
            document("u1", 0.1),
            document("u2", 0.2),
            document("u1", 0.8),
            document("u3", 0.3),
            document("u2", 0.9),
        ];
        let latest = latest_per_learner(&documents);
        let kept: Vec<(&str, f64)> = latest
            .iter()
            .map(|doc| (doc.learner_id.as_str(), doc.accuracy))
            .collect();
        assert_eq!(kept, vec![("u1", 0.8), ("u2", 0.9), ("u3", 0.3)]);
    }

    #[test]
    fn document_without_prediction_has_no_labels() {
        let record = CanonicalRecord {
            learner_id: "L9".to_string(),
            time_spent: 5.0,
            avg_score: 0.1,
            accuracy: 0.1,
            difficulty_level: 0,
            topic_progress: 0.1,
        };
        let doc = LearnerDocument::new(&record, None, Utc::now());
        assert!(doc.cluster_kmeans.is_none());
        assert!(doc.gmm_confidence.is_none());
    }
}
