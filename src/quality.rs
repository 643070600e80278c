//! Internal cluster quality scores, computed on a seeded row sample.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::features::FeatureMatrix;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityMetrics {
    pub rows: usize,
    pub sampled: usize,
    pub clusters: usize,
    pub silhouette: Option<f64>,
    pub davies_bouldin: Option<f64>,
    pub calinski_harabasz: Option<f64>,
    pub inertia: Option<f64>,
}

impl QualityMetrics {
    /// Scores `labels` against `matrix`. Scores that need at least two
    /// populated clusters (and more rows than clusters) are left `None`.
    pub fn compute(matrix: &FeatureMatrix, labels: &[usize], sample: usize, seed: u64) -> Self {
        let rows = matrix.len().min(labels.len());
        let indices = sample_indices(rows, sample, seed);
        let points: Vec<&[f64]> = indices.iter().map(|&i| matrix.row(i)).collect();
        let sampled_labels: Vec<usize> = indices.iter().map(|&i| labels[i]).collect();
        let groups = group_by_label(&sampled_labels);
        let clusters = groups.len();

        let scorable = clusters >= 2 && points.len() > clusters;
        let centroids: Vec<Vec<f64>> = groups
            .values()
            .map(|members| centroid(&points, members))
            .collect();

        Self {
            rows,
            sampled: points.len(),
            clusters,
            silhouette: scorable.then(|| silhouette(&points, &sampled_labels, &groups)),
            davies_bouldin: scorable.then(|| davies_bouldin(&points, &groups, &centroids)),
            calinski_harabasz: scorable
                .then(|| calinski_harabasz(&points, &groups, &centroids)),
            inertia: None,
        }
    }

    pub fn with_inertia(mut self, inertia: Option<f64>) -> Self {
        self.inertia = inertia;
        self
    }
}

fn sample_indices(rows: usize, sample: usize, seed: u64) -> Vec<usize> {
    if sample == 0 || rows <= sample {
        return (0..rows).collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, rows, sample).into_vec();
    picked.sort_unstable();
    picked
}

fn group_by_label(labels: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (position, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(position);
    }
    groups
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn centroid(points: &[&[f64]], members: &[usize]) -> Vec<f64> {
    let width = points.first().map(|p| p.len()).unwrap_or(0);
    let mut centre = vec![0.0; width];
    for &member in members {
        for (c, value) in centre.iter_mut().zip(points[member]) {
            *c += value;
        }
    }
    centre.iter_mut().for_each(|c| *c /= members.len() as f64);
    centre
}

fn silhouette(
    points: &[&[f64]],
    labels: &[usize],
    groups: &BTreeMap<usize, Vec<usize>>,
) -> f64 {
    let mut total = 0.0;
    for (i, point) in points.iter().enumerate() {
        let own = &groups[&labels[i]];
        if own.len() < 2 {
            continue;
        }
        let mean_to = |members: &[usize]| {
            members
                .iter()
                .filter(|&&j| j != i)
                .map(|&j| distance(point, points[j]))
                .sum::<f64>()
        };
        let a = mean_to(own) / (own.len() - 1) as f64;
        let b = groups
            .iter()
            .filter(|(&label, _)| label != labels[i])
            .map(|(_, members)| mean_to(members) / members.len() as f64)
            .fold(f64::INFINITY, f64::min);
        let spread = a.max(b);
        if spread > 0.0 {
            total += (b - a) / spread;
        }
    }
    total / points.len() as f64
}

fn davies_bouldin(
    points: &[&[f64]],
    groups: &BTreeMap<usize, Vec<usize>>,
    centroids: &[Vec<f64>],
) -> f64 {
    let scatter: Vec<f64> = groups
        .values()
        .zip(centroids)
        .map(|(members, centre)| {
            members
                .iter()
                .map(|&m| distance(points[m], centre))
                .sum::<f64>()
                / members.len() as f64
        })
        .collect();
    let k = centroids.len();
    let worst: f64 = (0..k)
        .map(|i| {
            (0..k)
                .filter(|&j| j != i)
                .map(|j| {
                    let separation = distance(&centroids[i], &centroids[j]);
                    if separation > 0.0 {
                        (scatter[i] + scatter[j]) / separation
                    } else {
                        0.0
                    }
                })
                .fold(0.0, f64::max)
        })
        .sum();
    worst / k as f64
}

fn calinski_harabasz(
    points: &[&[f64]],
    groups: &BTreeMap<usize, Vec<usize>>,
    centroids: &[Vec<f64>],
) -> f64 {
    let all: Vec<usize> = (0..points.len()).collect();
    let overall = centroid(points, &all);
    let mut between = 0.0;
    let mut within = 0.0;
    for (members, centre) in groups.values().zip(centroids) {
        between += members.len() as f64 * distance(centre, &overall).powi(2);
        within += members
            .iter()
            .map(|&m| distance(points[m], centre).powi(2))
            .sum::<f64>();
    }
    let n = points.len() as f64;
    let k = centroids.len() as f64;
    if within == 0.0 {
        return 1.0;
    }
    (between / (k - 1.0)) / (within / (n - k))
}
