//! Cluster models and the assigner that fits, persists and applies them.
//!
//! Two models can live side by side: a hard partition (k-means) and a soft
//! one (diagonal Gaussian mixture) that also yields a membership
//! confidence. Either may be absent; whichever is present answers
//! predictions. The assigner moves through `Unfit -> Fitting -> Fitted` and
//! refuses to predict outside `Fitted`.

use std::f64::consts::PI;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactStore, CENTROIDS, HARD_MODEL, SOFT_MODEL};
use crate::config::TrainingConfig;
use crate::error::{PipelineError, Result};
use crate::features::FeatureMatrix;
use crate::models::ClusterPrediction;

const LLOYD_TOLERANCE: f64 = 1e-8;
const EM_TOLERANCE: f64 = 1e-3;
const REG_COVAR: f64 = 1e-6;

/// Output of a single model for one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assignment {
    Label(usize),
    Scored { label: usize, confidence: f64 },
}

impl Assignment {
    pub fn label(self) -> usize {
        match self {
            Assignment::Label(label) | Assignment::Scored { label, .. } => label,
        }
    }

    pub fn confidence(self) -> Option<f64> {
        match self {
            Assignment::Label(_) => None,
            Assignment::Scored { confidence, .. } => Some(confidence),
        }
    }
}

pub trait Clusterer {
    fn width(&self) -> usize;
    fn n_clusters(&self) -> usize;
    fn assign(&self, row: &[f64]) -> Assignment;
    fn centroids(&self) -> &[Vec<f64>];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeans {
    centroids: Vec<Vec<f64>>,
    counts: Vec<u64>,
}

impl KMeans {
    /// Lloyd iterations from a k-means++ start.
    pub fn fit(matrix: &FeatureMatrix, k: usize, seed: u64, max_iter: usize) -> Result<Self> {
        if matrix.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = Self::seeded(matrix, k, &mut rng);
        let mut labels = vec![0usize; matrix.len()];

        for iteration in 0..max_iter.max(1) {
            for (row, label) in matrix.rows().zip(labels.iter_mut()) {
                *label = model.nearest(row).0;
            }
            let mut sums = vec![vec![0.0; matrix.width()]; k];
            let mut counts = vec![0u64; k];
            for (row, &label) in matrix.rows().zip(&labels) {
                counts[label] += 1;
                for (sum, value) in sums[label].iter_mut().zip(row) {
                    *sum += value;
                }
            }
            let mut shift: f64 = 0.0;
            for (cluster, sum) in sums.into_iter().enumerate() {
                if counts[cluster] == 0 {
                    continue;
                }
                let updated: Vec<f64> = sum
                    .into_iter()
                    .map(|s| s / counts[cluster] as f64)
                    .collect();
                shift = shift.max(squared_distance(&updated, &model.centroids[cluster]));
                model.centroids[cluster] = updated;
            }
            model.counts = counts;
            if shift <= LLOYD_TOLERANCE {
                tracing::debug!(iteration, "k-means converged");
                break;
            }
        }
        Ok(model)
    }

    /// Starts an online model from the first chunk it sees.
    pub fn seeded(matrix: &FeatureMatrix, k: usize, rng: &mut StdRng) -> Self {
        let k = k.max(1);
        let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
        centroids.push(matrix.row(rng.gen_range(0..matrix.len())).to_vec());
        while centroids.len() < k {
            let distances: Vec<f64> = matrix
                .rows()
                .map(|row| {
                    centroids
                        .iter()
                        .map(|c| squared_distance(row, c))
                        .fold(f64::INFINITY, f64::min)
                })
                .collect();
            let total: f64 = distances.iter().sum();
            let pick = if total > 0.0 {
                let mut target = rng.gen::<f64>() * total;
                distances
                    .iter()
                    .position(|d| {
                        target -= d;
                        target <= 0.0
                    })
                    .unwrap_or(matrix.len() - 1)
            } else {
                rng.gen_range(0..matrix.len())
            };
            centroids.push(matrix.row(pick).to_vec());
        }
        Self {
            counts: vec![0; k],
            centroids,
        }
    }

    /// Mini-batch update: each row pulls its nearest centre with a
    /// per-centre learning rate of `1 / count`.
    pub fn partial_fit(&mut self, chunk: &FeatureMatrix) {
        for row in chunk.rows() {
            let (cluster, _) = self.nearest(row);
            self.counts[cluster] += 1;
            let rate = 1.0 / self.counts[cluster] as f64;
            for (centre, value) in self.centroids[cluster].iter_mut().zip(row) {
                *centre += rate * (value - *centre);
            }
        }
    }

    pub fn nearest(&self, row: &[f64]) -> (usize, f64) {
        self.centroids
            .iter()
            .enumerate()
            .map(|(cluster, centre)| (cluster, squared_distance(row, centre)))
            .fold((0, f64::INFINITY), |best, candidate| {
                if candidate.1 < best.1 {
                    candidate
                } else {
                    best
                }
            })
    }

    pub fn inertia(&self, matrix: &FeatureMatrix) -> f64 {
        matrix.rows().map(|row| self.nearest(row).1).sum()
    }
}

impl Clusterer for KMeans {
    fn width(&self) -> usize {
        self.centroids.first().map(Vec::len).unwrap_or(0)
    }

    fn n_clusters(&self) -> usize {
        self.centroids.len()
    }

    fn assign(&self, row: &[f64]) -> Assignment {
        Assignment::Label(self.nearest(row).0)
    }

    fn centroids(&self) -> &[Vec<f64>] {
        &self.centroids
    }
}

/// Gaussian mixture with one diagonal covariance per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixture {
    weights: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

impl GaussianMixture {
    /// Expectation-maximisation started from a k-means partition.
    pub fn fit(matrix: &FeatureMatrix, k: usize, seed: u64, max_iter: usize) -> Result<Self> {
        let start = KMeans::fit(matrix, k, seed, max_iter)?;
        let mut responsibilities: Vec<Vec<f64>> = matrix
            .rows()
            .map(|row| {
                let mut r = vec![0.0; start.n_clusters()];
                r[start.nearest(row).0] = 1.0;
                r
            })
            .collect();
        let mut model = Self::maximise(matrix, &responsibilities);
        let mut previous = f64::NEG_INFINITY;

        for iteration in 0..max_iter.max(1) {
            let mut total = 0.0;
            for (row, r) in matrix.rows().zip(responsibilities.iter_mut()) {
                let log_prob = model.weighted_log_prob(row);
                let norm = log_sum_exp(&log_prob);
                total += norm;
                for (slot, lp) in r.iter_mut().zip(&log_prob) {
                    *slot = (lp - norm).exp();
                }
            }
            let mean_log_likelihood = total / matrix.len() as f64;
            model = Self::maximise(matrix, &responsibilities);
            if (mean_log_likelihood - previous).abs() < EM_TOLERANCE {
                tracing::debug!(iteration, mean_log_likelihood, "mixture converged");
                break;
            }
            previous = mean_log_likelihood;
        }
        Ok(model)
    }

    fn maximise(matrix: &FeatureMatrix, responsibilities: &[Vec<f64>]) -> Self {
        let k = responsibilities.first().map(Vec::len).unwrap_or(0);
        let width = matrix.width();
        let n = matrix.len() as f64;
        let mut weights = Vec::with_capacity(k);
        let mut means = Vec::with_capacity(k);
        let mut variances = Vec::with_capacity(k);

        for cluster in 0..k {
            let mass: f64 =
                responsibilities.iter().map(|r| r[cluster]).sum::<f64>() + 10.0 * f64::EPSILON;
            let mut mean = vec![0.0; width];
            for (row, r) in matrix.rows().zip(responsibilities) {
                for (m, value) in mean.iter_mut().zip(row) {
                    *m += r[cluster] * value;
                }
            }
            mean.iter_mut().for_each(|m| *m /= mass);
            let mut variance = vec![0.0; width];
            for (row, r) in matrix.rows().zip(responsibilities) {
                for ((v, value), m) in variance.iter_mut().zip(row).zip(&mean) {
                    *v += r[cluster] * (value - m).powi(2);
                }
            }
            variance.iter_mut().for_each(|v| *v = *v / mass + REG_COVAR);
            weights.push(mass / n);
            means.push(mean);
            variances.push(variance);
        }
        Self {
            weights,
            means,
            variances,
        }
    }

    fn weighted_log_prob(&self, row: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.means)
            .zip(&self.variances)
            .map(|((weight, mean), variance)| {
                let density: f64 = row
                    .iter()
                    .zip(mean)
                    .zip(variance)
                    .map(|((x, m), v)| (2.0 * PI * v).ln() + (x - m).powi(2) / v)
                    .sum();
                weight.ln() - 0.5 * density
            })
            .collect()
    }

    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let log_prob = self.weighted_log_prob(row);
        let norm = log_sum_exp(&log_prob);
        log_prob.iter().map(|lp| (lp - norm).exp()).collect()
    }
}

impl Clusterer for GaussianMixture {
    fn width(&self) -> usize {
        self.means.first().map(Vec::len).unwrap_or(0)
    }

    fn n_clusters(&self) -> usize {
        self.means.len()
    }

    fn assign(&self, row: &[f64]) -> Assignment {
        let (label, confidence) = self
            .predict_proba(row)
            .into_iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });
        Assignment::Scored { label, confidence }
    }

    fn centroids(&self) -> &[Vec<f64>] {
        &self.means
    }
}

/// Fixed-capacity uniform sample over a single pass. After `seen` offers
/// every offered item is resident with probability `capacity / seen`.
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    capacity: usize,
    seen: u64,
    items: Vec<T>,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity.min(1 << 16)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if slot < self.capacity as u64 {
            self.items[slot as usize] = item;
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

#[derive(Debug, Clone, Default)]
pub struct FittedModels {
    pub hard: Option<KMeans>,
    pub soft: Option<GaussianMixture>,
}

impl FittedModels {
    pub fn width(&self) -> Option<usize> {
        self.hard
            .as_ref()
            .map(Clusterer::width)
            .or_else(|| self.soft.as_ref().map(Clusterer::width))
    }

    pub fn centroids(&self) -> Option<&[Vec<f64>]> {
        self.hard
            .as_ref()
            .map(Clusterer::centroids)
            .or_else(|| self.soft.as_ref().map(Clusterer::centroids))
    }

    fn predict_row(&self, row: &[f64]) -> Option<ClusterPrediction> {
        let hard = self.hard.as_ref().map(|m| m.assign(row));
        let soft = self.soft.as_ref().map(|m| m.assign(row));
        let cluster = hard.or(soft)?.label();
        Some(ClusterPrediction {
            cluster,
            hard_cluster: hard.map(Assignment::label),
            soft_cluster: soft.map(Assignment::label),
            confidence: soft.and_then(Assignment::confidence),
        })
    }
}

#[derive(Debug)]
struct StreamingFit {
    hard: Option<KMeans>,
    reservoir: Reservoir<Vec<f64>>,
    rng: StdRng,
    width: Option<usize>,
}

#[derive(Debug)]
enum AssignerState {
    Unfit,
    Fitting(StreamingFit),
    Fitted(FittedModels),
}

pub struct ClusterAssigner {
    n_clusters: usize,
    seed: u64,
    max_iter: usize,
    store: ArtifactStore,
    state: AssignerState,
}

impl ClusterAssigner {
    pub fn new(training: &TrainingConfig, store: ArtifactStore) -> Self {
        Self {
            n_clusters: training.n_clusters,
            seed: training.random_state,
            max_iter: training.max_iter,
            store,
            state: AssignerState::Unfit,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, AssignerState::Fitted(_))
    }

    /// Fits both models on the full matrix.
    pub fn fit(&mut self, matrix: &FeatureMatrix) -> Result<()> {
        if matrix.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let hard = KMeans::fit(matrix, self.n_clusters, self.seed, self.max_iter)?;
        let soft = GaussianMixture::fit(matrix, self.n_clusters, self.seed, self.max_iter)?;
        tracing::info!(
            rows = matrix.len(),
            width = matrix.width(),
            clusters = self.n_clusters,
            "cluster models fitted"
        );
        self.commit(FittedModels {
            hard: Some(hard),
            soft: Some(soft),
        })
    }

    pub fn begin_streaming(&mut self, sample_cap: usize) {
        self.state = AssignerState::Fitting(StreamingFit {
            hard: None,
            reservoir: Reservoir::new(sample_cap, self.seed),
            rng: StdRng::seed_from_u64(self.seed),
            width: None,
        });
    }

    pub fn feed_chunk(&mut self, chunk: &FeatureMatrix) -> Result<()> {
        let AssignerState::Fitting(stream) = &mut self.state else {
            return Err(PipelineError::Config(
                "feed_chunk called outside a streaming fit".to_string(),
            ));
        };
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(expected) = stream.width {
            if expected != chunk.width() {
                return Err(PipelineError::WidthMismatch {
                    expected,
                    found: chunk.width(),
                });
            }
        }
        stream.width = Some(chunk.width());
        let hard = stream
            .hard
            .get_or_insert_with(|| KMeans::seeded(chunk, self.n_clusters, &mut stream.rng));
        hard.partial_fit(chunk);
        for row in chunk.rows() {
            stream.reservoir.offer(row.to_vec());
        }
        tracing::debug!(
            rows = chunk.len(),
            seen = stream.reservoir.seen(),
            "streamed chunk"
        );
        Ok(())
    }

    /// Fits the mixture once on the final reservoir and persists both
    /// models.
    pub fn finish_streaming(&mut self) -> Result<()> {
        let stream = match std::mem::replace(&mut self.state, AssignerState::Unfit) {
            AssignerState::Fitting(stream) => stream,
            other => {
                self.state = other;
                return Err(PipelineError::Config(
                    "finish_streaming called outside a streaming fit".to_string(),
                ));
            }
        };
        let (Some(hard), Some(width)) = (stream.hard, stream.width) else {
            return Err(PipelineError::EmptyInput);
        };
        let seen = stream.reservoir.seen();
        let sample = stream.reservoir.into_items();
        let sample = FeatureMatrix::new(width, sample.into_iter().flatten().collect());
        let soft = GaussianMixture::fit(&sample, self.n_clusters, self.seed, self.max_iter)?;
        tracing::info!(
            seen,
            sampled = sample.len(),
            clusters = self.n_clusters,
            "streaming fit complete"
        );
        self.commit(FittedModels {
            hard: Some(hard),
            soft: Some(soft),
        })
    }

    pub fn fit_streaming<I>(&mut self, chunks: I, sample_cap: usize) -> Result<()>
    where
        I: IntoIterator<Item = FeatureMatrix>,
    {
        self.begin_streaming(sample_cap);
        for chunk in chunks {
            self.feed_chunk(&chunk)?;
        }
        self.finish_streaming()
    }

    pub fn predict(&mut self, matrix: &FeatureMatrix) -> Result<Vec<ClusterPrediction>> {
        let models = self.ensure_loaded()?;
        let expected = models.width().unwrap_or(0);
        if !matrix.is_empty() && matrix.width() != expected {
            return Err(PipelineError::WidthMismatch {
                expected,
                found: matrix.width(),
            });
        }
        matrix
            .rows()
            .map(|row| {
                models.predict_row(row).ok_or(PipelineError::MissingArtifact {
                    artifact: "cluster model",
                })
            })
            .collect()
    }

    pub fn models(&mut self) -> Result<&FittedModels> {
        self.ensure_loaded()
    }

    /// Writes one row per cluster with feature-named columns.
    pub fn write_centroids(&mut self, feature_names: &[String]) -> Result<Option<PathBuf>> {
        let path = self.store.path(CENTROIDS);
        let models = self.ensure_loaded()?;
        let Some(centroids) = models.centroids() else {
            return Ok(None);
        };
        let width = centroids.first().map(Vec::len).unwrap_or(0);
        let mut header = vec!["cluster".to_string()];
        if feature_names.len() == width {
            header.extend(feature_names.iter().cloned());
        } else {
            header.extend((0..width).map(|i| format!("f{i}")));
        }
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&header)?;
        for (cluster, centre) in centroids.iter().enumerate() {
            let mut record = vec![cluster.to_string()];
            record.extend(centre.iter().map(|v| format!("{v:.6}")));
            writer.write_record(&record)?;
        }
        writer.flush().map_err(|e| PipelineError::io(&path, e))?;
        Ok(Some(path))
    }

    fn commit(&mut self, models: FittedModels) -> Result<()> {
        match &models.hard {
            Some(model) => {
                self.store.save(HARD_MODEL, model)?;
            }
            None => self.store.remove(HARD_MODEL)?,
        }
        match &models.soft {
            Some(model) => {
                self.store.save(SOFT_MODEL, model)?;
            }
            None => self.store.remove(SOFT_MODEL)?,
        }
        self.state = AssignerState::Fitted(models);
        Ok(())
    }

    fn ensure_loaded(&mut self) -> Result<&FittedModels> {
        match self.state {
            AssignerState::Fitted(_) => {}
            AssignerState::Fitting(_) => {
                return Err(PipelineError::MissingArtifact {
                    artifact: "cluster model",
                })
            }
            AssignerState::Unfit => {
                let models = FittedModels {
                    hard: self.store.load(HARD_MODEL)?,
                    soft: self.store.load(SOFT_MODEL)?,
                };
                if models.hard.is_none() && models.soft.is_none() {
                    return Err(PipelineError::MissingArtifact {
                        artifact: "cluster model",
                    });
                }
                self.state = AssignerState::Fitted(models);
            }
        }
        match &self.state {
            AssignerState::Fitted(models) => Ok(models),
            _ => Err(PipelineError::MissingArtifact {
                artifact: "cluster model",
            }),
        }
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}
