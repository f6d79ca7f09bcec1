//! Internal validity metrics and ranking of competing clustering models

use crate::error::TrialError;
use crate::model::{canonicalize_labels, euclidean_distance, ClusterAlgorithm, ClusterLabel};
use log::{info, warn};
use ndarray::{Array1, Array2};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

/// Weights of the composite score: silhouette, Calinski-Harabasz, Davies-Bouldin
pub const COMPOSITE_WEIGHTS: [f64; 3] = [0.4, 0.3, 0.3];

/// Calinski-Harabasz values are divided by this before weighting
pub const CALINSKI_SCALE: f64 = 1000.0;

/// The three internal validity metrics of one labelling
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidityMetrics {
    /// Cohesion/separation in [-1, 1], higher is better
    pub silhouette: f64,
    /// Between/within dispersion ratio, higher is better
    pub calinski_harabasz: f64,
    /// Average worst-case cluster similarity, lower is better
    pub davies_bouldin: f64,
}

impl ValidityMetrics {
    /// Weighted blend with every term mapped onto a comparable range.
    pub fn composite(&self) -> f64 {
        COMPOSITE_WEIGHTS[0] * self.silhouette
            + COMPOSITE_WEIGHTS[1] * (self.calinski_harabasz / CALINSKI_SCALE)
            + COMPOSITE_WEIGHTS[2] * (1.0 / (1.0 + self.davies_bouldin))
    }
}

/// Row indices of each label group. Noise forms a group of its own.
fn group_members(labels: &[ClusterLabel]) -> Vec<Vec<usize>> {
    let mut groups: BTreeMap<ClusterLabel, Vec<usize>> = BTreeMap::new();
    for (idx, label) in labels.iter().enumerate() {
        groups.entry(*label).or_default().push(idx);
    }
    groups.into_values().collect()
}

fn centroid(features: &Array2<f64>, members: &[usize]) -> Array1<f64> {
    let mut sum = Array1::<f64>::zeros(features.ncols());
    for &idx in members {
        sum += &features.row(idx);
    }
    sum / members.len() as f64
}

fn distance(features: &Array2<f64>, i: usize, j: usize) -> f64 {
    euclidean_distance(&features.row(i), &features.row(j))
}

fn silhouette(features: &Array2<f64>, groups: &[Vec<usize>], group_of: &[usize]) -> f64 {
    let n = features.nrows();
    let mut total = 0.0;
    for i in 0..n {
        let own = group_of[i];
        if groups[own].len() < 2 {
            // singleton clusters contribute 0
            continue;
        }
        let mean_to = |members: &[usize]| {
            members.iter().map(|&j| distance(features, i, j)).sum::<f64>()
        };
        let a = mean_to(&groups[own]) / (groups[own].len() - 1) as f64;
        let b = groups
            .iter()
            .enumerate()
            .filter(|(g, _)| *g != own)
            .map(|(_, members)| mean_to(members) / members.len() as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    total / n as f64
}

fn calinski_harabasz(features: &Array2<f64>, groups: &[Vec<usize>], centroids: &[Array1<f64>]) -> f64 {
    let n = features.nrows() as f64;
    let k = groups.len() as f64;
    let overall = centroid(features, &(0..features.nrows()).collect::<Vec<_>>());

    let mut between = 0.0;
    let mut within = 0.0;
    for (members, center) in groups.iter().zip(centroids) {
        between += members.len() as f64
            * euclidean_distance(&center.view(), &overall.view()).powi(2);
        for &idx in members {
            within += euclidean_distance(&features.row(idx), &center.view()).powi(2);
        }
    }

    if within == 0.0 {
        1.0
    } else {
        between * (n - k) / (within * (k - 1.0))
    }
}

fn davies_bouldin(features: &Array2<f64>, groups: &[Vec<usize>], centroids: &[Array1<f64>]) -> f64 {
    let spreads: Vec<f64> = groups
        .iter()
        .zip(centroids)
        .map(|(members, center)| {
            members
                .iter()
                .map(|&idx| euclidean_distance(&features.row(idx), &center.view()))
                .sum::<f64>()
                / members.len() as f64
        })
        .collect();

    let k = groups.len();
    let mut total = 0.0;
    for i in 0..k {
        let worst = (0..k)
            .filter(|&j| j != i)
            .map(|j| {
                let separation = euclidean_distance(&centroids[i].view(), &centroids[j].view());
                // coincident centroids are treated as infinitely far apart
                if separation == 0.0 {
                    0.0
                } else {
                    (spreads[i] + spreads[j]) / separation
                }
            })
            .fold(0.0, f64::max);
        total += worst;
    }
    total / k as f64
}

/// Compute silhouette, Calinski-Harabasz and Davies-Bouldin for a labelling.
///
/// Fails when the number of distinct labels is outside `2..=n-1` or when a
/// metric is not finite.
pub fn evaluate_labels(
    features: &Array2<f64>,
    labels: &[ClusterLabel],
) -> Result<ValidityMetrics, TrialError> {
    let n_samples = features.nrows();
    let groups = group_members(labels);
    if labels.len() != n_samples || groups.len() < 2 || groups.len() >= n_samples {
        return Err(TrialError::DegenerateLabels {
            n_labels: groups.len(),
            n_samples,
        });
    }

    let mut group_of = vec![0usize; n_samples];
    for (g, members) in groups.iter().enumerate() {
        for &idx in members {
            group_of[idx] = g;
        }
    }
    let centroids: Vec<Array1<f64>> = groups.iter().map(|m| centroid(features, m)).collect();

    let metrics = ValidityMetrics {
        silhouette: silhouette(features, &groups, &group_of),
        calinski_harabasz: calinski_harabasz(features, &groups, &centroids),
        davies_bouldin: davies_bouldin(features, &groups, &centroids),
    };

    for (metric, value) in [
        ("silhouette", metrics.silhouette),
        ("calinski_harabasz", metrics.calinski_harabasz),
        ("davies_bouldin", metrics.davies_bouldin),
    ] {
        if !value.is_finite() {
            return Err(TrialError::NonFinite { metric });
        }
    }
    Ok(metrics)
}

/// Result of one successful trial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteringTrialResult {
    pub algorithm_name: String,
    #[serde(skip)]
    pub labels: Vec<ClusterLabel>,
    pub metrics: ValidityMetrics,
    /// Distinct labels, with noise counted as one cluster when present
    pub cluster_count: usize,
    pub noise_count: usize,
}

/// Outcome of one trial; errored trials are kept for reporting only
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub algorithm_name: String,
    pub supports_noise: bool,
    pub result: Result<ClusteringTrialResult, TrialError>,
}

/// Fit one model and score its labelling
pub fn run_trial(features: &Array2<f64>, algorithm: &dyn ClusterAlgorithm) -> TrialOutcome {
    let algorithm_name = algorithm.name();
    let result = algorithm.fit(features).and_then(|labels| {
        let labels = canonicalize_labels(&labels);
        let metrics = evaluate_labels(features, &labels)?;
        let noise_count = labels.iter().filter(|l| l.is_noise()).count();
        let cluster_count = labels.iter().collect::<BTreeSet<_>>().len();
        Ok(ClusteringTrialResult {
            algorithm_name: algorithm_name.clone(),
            labels,
            metrics,
            cluster_count,
            noise_count,
        })
    });

    match &result {
        Ok(r) => info!(
            "{}: silhouette={:.3} CH={:.1} DB={:.3} clusters={} noise={}",
            algorithm_name,
            r.metrics.silhouette,
            r.metrics.calinski_harabasz,
            r.metrics.davies_bouldin,
            r.cluster_count,
            r.noise_count
        ),
        Err(e) => warn!("{}: excluded from ranking: {}", algorithm_name, e),
    }

    TrialOutcome {
        algorithm_name,
        supports_noise: algorithm.supports_noise(),
        result,
    }
}

/// Run every trial against the same feature matrix.
///
/// Trials are independent and run in parallel. Outcomes keep input order.
#[cfg(feature = "rayon")]
pub fn run_trials(
    features: &Array2<f64>,
    algorithms: &[Box<dyn ClusterAlgorithm>],
) -> Vec<TrialOutcome> {
    algorithms
        .par_iter()
        .map(|algorithm| run_trial(features, algorithm.as_ref()))
        .collect()
}

/// Run every trial against the same feature matrix, in input order.
#[cfg(not(feature = "rayon"))]
pub fn run_trials(
    features: &Array2<f64>,
    algorithms: &[Box<dyn ClusterAlgorithm>],
) -> Vec<TrialOutcome> {
    algorithms
        .iter()
        .map(|algorithm| run_trial(features, algorithm.as_ref()))
        .collect()
}

/// One row of the comparison table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub algorithm_name: String,
    pub supports_noise: bool,
    pub metrics: Option<ValidityMetrics>,
    pub composite: Option<f64>,
    pub cluster_count: Option<usize>,
    pub noise_count: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTrial {
    pub rank: usize,
    pub algorithm_name: String,
    pub composite: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricLeader {
    pub algorithm_name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub trials: Vec<TrialSummary>,
    pub ranking: Vec<RankedTrial>,
    pub recommended: Option<String>,
    pub best_silhouette: Option<MetricLeader>,
    pub best_calinski_harabasz: Option<MetricLeader>,
    pub best_davies_bouldin: Option<MetricLeader>,
}

fn leader(
    results: &[&ClusteringTrialResult],
    value: impl Fn(&ValidityMetrics) -> f64,
    higher_is_better: bool,
) -> Option<MetricLeader> {
    let mut best: Option<&ClusteringTrialResult> = None;
    for &candidate in results {
        let better = match best {
            None => true,
            Some(current) if higher_is_better => {
                value(&candidate.metrics) > value(&current.metrics)
            }
            Some(current) => value(&candidate.metrics) < value(&current.metrics),
        };
        if better {
            best = Some(candidate);
        }
    }
    best.map(|r| MetricLeader {
        algorithm_name: r.algorithm_name.clone(),
        value: value(&r.metrics),
    })
}

impl ComparisonReport {
    /// Rank non-errored trials by composite score.
    ///
    /// Ties keep trial order, so the first of equally scored trials is
    /// recommended.
    pub fn from_outcomes(outcomes: &[TrialOutcome]) -> Self {
        let trials = outcomes
            .iter()
            .map(|outcome| match &outcome.result {
                Ok(r) => TrialSummary {
                    algorithm_name: outcome.algorithm_name.clone(),
                    supports_noise: outcome.supports_noise,
                    metrics: Some(r.metrics),
                    composite: Some(r.metrics.composite()),
                    cluster_count: Some(r.cluster_count),
                    noise_count: Some(r.noise_count),
                    error: None,
                },
                Err(e) => TrialSummary {
                    algorithm_name: outcome.algorithm_name.clone(),
                    supports_noise: outcome.supports_noise,
                    metrics: None,
                    composite: None,
                    cluster_count: None,
                    noise_count: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        let valid: Vec<&ClusteringTrialResult> =
            outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect();

        let mut scored: Vec<(&str, f64)> = valid
            .iter()
            .map(|r| (r.algorithm_name.as_str(), r.metrics.composite()))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let ranking: Vec<RankedTrial> = scored
            .iter()
            .enumerate()
            .map(|(idx, (name, composite))| RankedTrial {
                rank: idx + 1,
                algorithm_name: name.to_string(),
                composite: *composite,
            })
            .collect();

        let recommended = ranking.first().map(|r| r.algorithm_name.clone());
        match &recommended {
            Some(name) => info!("Recommended algorithm: {}", name),
            None => warn!("No clustering trial produced valid metrics"),
        }

        Self {
            trials,
            ranking,
            recommended,
            best_silhouette: leader(&valid, |m| m.silhouette, true),
            best_calinski_harabasz: leader(&valid, |m| m.calinski_harabasz, true),
            best_davies_bouldin: leader(&valid, |m| m.davies_bouldin, false),
        }
    }

    /// Markdown summary: per-trial table, metric leaders and ranking
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Clustering Algorithm Comparison\n");
        let _ = writeln!(
            out,
            "| Algorithm | Silhouette | Calinski-Harabasz | Davies-Bouldin | Clusters | Noise | Composite |"
        );
        let _ = writeln!(out, "|---|---|---|---|---|---|---|");
        for trial in &self.trials {
            match (&trial.metrics, trial.composite) {
                (Some(m), Some(composite)) => {
                    let _ = writeln!(
                        out,
                        "| {} | {:.3} | {:.1} | {:.3} | {} | {} | {:.3} |",
                        trial.algorithm_name,
                        m.silhouette,
                        m.calinski_harabasz,
                        m.davies_bouldin,
                        trial.cluster_count.unwrap_or(0),
                        trial.noise_count.unwrap_or(0),
                        composite
                    );
                }
                _ => {
                    let _ = writeln!(
                        out,
                        "| {} | ERROR | ERROR | ERROR | ERROR | ERROR | {} |",
                        trial.algorithm_name,
                        trial.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }

        let _ = writeln!(out, "\n## Best per metric\n");
        for (label, best) in [
            ("Silhouette", &self.best_silhouette),
            ("Calinski-Harabasz", &self.best_calinski_harabasz),
            ("Davies-Bouldin", &self.best_davies_bouldin),
        ] {
            if let Some(best) = best {
                let _ = writeln!(out, "- {}: {} ({:.3})", label, best.algorithm_name, best.value);
            }
        }

        let _ = writeln!(out, "\n## Ranking (composite score)\n");
        for ranked in &self.ranking {
            let _ = writeln!(
                out,
                "{}. {}: {:.3}",
                ranked.rank, ranked.algorithm_name, ranked.composite
            );
        }

        let _ = writeln!(
            out,
            "\n## Recommendation\n\n{}",
            self.recommended
                .as_deref()
                .unwrap_or("No valid clustering result")
        );
        out
    }

    /// Write as JSON when `path` ends in `.json`, otherwise as Markdown
    pub fn write(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let body = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)?
        } else {
            self.to_markdown()
        };
        std::fs::write(path, body)?;
        info!("Comparison report saved to {}", path.display());
        Ok(())
    }
}
