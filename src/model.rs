//! Clustering engine: feature standardization and interchangeable partition models

use crate::error::{SegmentError, TrialError};
use crate::hierarchical::ward_labels;
use crate::rfm::RfmRecord;
use linfa::prelude::*;
use linfa::DatasetBase;
use linfa_clustering::{Dbscan, GaussianMixtureModel, KMeans};
use linfa_nn::distance::L2Dist;
use linfa_preprocessing::linear_scaling::LinearScaler;
use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Number of RFM features fed to the models
pub const N_FEATURES: usize = 3;

/// Cluster assignment of one record.
///
/// Density-based models may decline to assign a point; that is `Noise`,
/// which serializes as [`ClusterLabel::NOISE_SENTINEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterLabel {
    Noise,
    Cluster(usize),
}

impl ClusterLabel {
    pub const NOISE_SENTINEL: i64 = -1;

    pub fn as_i64(self) -> i64 {
        match self {
            ClusterLabel::Noise => Self::NOISE_SENTINEL,
            ClusterLabel::Cluster(id) => id as i64,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        usize::try_from(value).map_or(ClusterLabel::Noise, ClusterLabel::Cluster)
    }

    pub fn is_noise(self) -> bool {
        self == ClusterLabel::Noise
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterLabel::Noise => f.write_str("noise"),
            ClusterLabel::Cluster(id) => write!(f, "{id}"),
        }
    }
}

impl Serialize for ClusterLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

/// Per-feature zero-mean, unit-variance scaler on top of linfa's linear scaler.
///
/// Population standard deviation is used; a constant feature keeps scale 1.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    inner: LinearScaler<f64>,
}

impl StandardScaler {
    pub fn fit(data: &Array2<f64>) -> crate::Result<Self> {
        if data.nrows() == 0 {
            anyhow::bail!("cannot fit a scaler on zero rows");
        }
        let dataset = DatasetBase::from(data.clone());
        let inner = LinearScaler::standard().fit(&dataset)?;
        Ok(Self { inner })
    }

    /// Per-feature means removed before scaling
    pub fn means(&self) -> &Array1<f64> {
        self.inner.offsets()
    }

    /// Per-feature multipliers (reciprocal standard deviations)
    pub fn scales(&self) -> &Array1<f64> {
        self.inner.scales()
    }

    pub fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        self.inner.transform(data.clone())
    }

    /// Scale a single raw observation
    pub fn transform_row(&self, row: &[f64]) -> crate::Result<Array1<f64>> {
        let expected = self.means().len();
        if row.len() != expected {
            return Err(SegmentError::InvalidPrediction(format!(
                "expected {} features, got {}",
                expected,
                row.len()
            ))
            .into());
        }
        let point = Array2::from_shape_vec((1, expected), row.to_vec())?;
        Ok(self.transform(&point).row(0).to_owned())
    }
}

impl PartialEq for StandardScaler {
    fn eq(&self, other: &Self) -> bool {
        self.means() == other.means() && self.scales() == other.scales()
    }
}

/// Raw (recency, frequency, monetary) matrix, one row per record
pub fn feature_matrix<'a>(records: impl IntoIterator<Item = &'a RfmRecord>) -> Array2<f64> {
    let mut raw = Vec::new();
    let mut n_rows = 0;
    for rec in records {
        raw.extend_from_slice(&[rec.recency as f64, rec.frequency as f64, rec.monetary]);
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, N_FEATURES), raw)
        .unwrap_or_else(|_| Array2::zeros((0, N_FEATURES)))
}

/// A partitioning model that can be tried interchangeably with others.
pub trait ClusterAlgorithm: Send + Sync {
    /// Display name used in reports
    fn name(&self) -> String;

    /// Whether the model may leave points unassigned
    fn supports_noise(&self) -> bool {
        false
    }

    /// Fit on standardized features and label every row.
    fn fit(&self, features: &Array2<f64>) -> Result<Vec<ClusterLabel>, TrialError>;
}

fn ensure_enough_samples(features: &Array2<f64>, n_clusters: usize) -> Result<(), TrialError> {
    if features.nrows() < n_clusters.max(2) {
        return Err(TrialError::TooFewSamples {
            n_samples: features.nrows(),
            n_clusters,
        });
    }
    Ok(())
}

/// K-Means from linfa with a seeded generator
#[derive(Debug, Clone)]
pub struct KMeansTrial {
    pub clusters: usize,
    pub n_runs: usize,
    pub max_iters: u64,
    pub tolerance: f64,
    pub seed: u64,
}

impl ClusterAlgorithm for KMeansTrial {
    fn name(&self) -> String {
        format!("K-Means ({} clusters)", self.clusters)
    }

    fn fit(&self, features: &Array2<f64>) -> Result<Vec<ClusterLabel>, TrialError> {
        ensure_enough_samples(features, self.clusters)?;

        let dataset = DatasetBase::from(features.clone());
        let rng = Pcg64Mcg::seed_from_u64(self.seed);
        let model = KMeans::params_with(self.clusters, rng, L2Dist)
            .n_runs(self.n_runs)
            .max_n_iterations(self.max_iters)
            .tolerance(self.tolerance)
            .fit(&dataset)
            .map_err(|e| TrialError::Fit(e.to_string()))?;

        let labels: Array1<usize> = model.predict(features);
        Ok(labels.iter().map(|&l| ClusterLabel::Cluster(l)).collect())
    }
}

/// Gaussian mixture from linfa; each point takes its most likely component
#[derive(Debug, Clone)]
pub struct GaussianMixtureTrial {
    pub components: usize,
    pub seed: u64,
}

impl ClusterAlgorithm for GaussianMixtureTrial {
    fn name(&self) -> String {
        format!("Gaussian Mixture ({})", self.components)
    }

    fn fit(&self, features: &Array2<f64>) -> Result<Vec<ClusterLabel>, TrialError> {
        ensure_enough_samples(features, self.components)?;

        let dataset = DatasetBase::from(features.clone());
        let rng = Pcg64Mcg::seed_from_u64(self.seed);
        let model = GaussianMixtureModel::params(self.components)
            .with_rng(rng)
            .fit(&dataset)
            .map_err(|e| TrialError::Fit(e.to_string()))?;

        let labels: Array1<usize> = model.predict(features);
        Ok(labels.iter().map(|&l| ClusterLabel::Cluster(l)).collect())
    }
}

/// DBSCAN from linfa; unreachable points are noise
#[derive(Debug, Clone)]
pub struct DbscanTrial {
    pub eps: f64,
    pub min_samples: usize,
}

impl ClusterAlgorithm for DbscanTrial {
    fn name(&self) -> String {
        format!("DBSCAN (eps={})", self.eps)
    }

    fn supports_noise(&self) -> bool {
        true
    }

    fn fit(&self, features: &Array2<f64>) -> Result<Vec<ClusterLabel>, TrialError> {
        ensure_enough_samples(features, 2)?;

        let memberships: Array1<Option<usize>> = Dbscan::params(self.min_samples)
            .tolerance(self.eps)
            .transform(features)
            .map_err(|e| TrialError::Fit(e.to_string()))?;

        Ok(memberships
            .iter()
            .map(|l| l.map_or(ClusterLabel::Noise, ClusterLabel::Cluster))
            .collect())
    }
}

/// Ward-linkage agglomerative clustering cut at a fixed cluster count
#[derive(Debug, Clone)]
pub struct AgglomerativeTrial {
    pub clusters: usize,
}

impl ClusterAlgorithm for AgglomerativeTrial {
    fn name(&self) -> String {
        format!("Agglomerative ({})", self.clusters)
    }

    fn fit(&self, features: &Array2<f64>) -> Result<Vec<ClusterLabel>, TrialError> {
        ensure_enough_samples(features, self.clusters)?;
        Ok(ward_labels(features, self.clusters)
            .into_iter()
            .map(ClusterLabel::Cluster)
            .collect())
    }
}

/// Serializable description of a clustering trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum TrialSpec {
    KMeans {
        clusters: usize,
        #[serde(default = "default_n_runs")]
        n_runs: usize,
        #[serde(default = "default_max_iters")]
        max_iters: u64,
        #[serde(default = "default_tolerance")]
        tolerance: f64,
    },
    GaussianMixture {
        components: usize,
    },
    Agglomerative {
        clusters: usize,
    },
    Dbscan {
        eps: f64,
        min_samples: usize,
    },
}

fn default_n_runs() -> usize {
    10
}

fn default_max_iters() -> u64 {
    300
}

fn default_tolerance() -> f64 {
    1e-4
}

impl TrialSpec {
    pub fn kmeans(clusters: usize) -> Self {
        TrialSpec::KMeans {
            clusters,
            n_runs: default_n_runs(),
            max_iters: default_max_iters(),
            tolerance: default_tolerance(),
        }
    }

    /// Standard comparison suite: K-Means, Gaussian mixture, Ward and
    /// DBSCAN at a spread of settings.
    pub fn default_suite() -> Vec<Self> {
        vec![
            TrialSpec::kmeans(4),
            TrialSpec::kmeans(3),
            TrialSpec::kmeans(5),
            TrialSpec::kmeans(6),
            TrialSpec::GaussianMixture { components: 4 },
            TrialSpec::Agglomerative { clusters: 4 },
            TrialSpec::Agglomerative { clusters: 3 },
            TrialSpec::Agglomerative { clusters: 5 },
            TrialSpec::Dbscan { eps: 0.5, min_samples: 5 },
            TrialSpec::Dbscan { eps: 0.8, min_samples: 5 },
            TrialSpec::Dbscan { eps: 1.0, min_samples: 5 },
        ]
    }

    /// The four models drawn side by side in the comparison chart
    pub fn comparison_panels() -> Vec<Self> {
        vec![
            TrialSpec::kmeans(4),
            TrialSpec::GaussianMixture { components: 4 },
            TrialSpec::Agglomerative { clusters: 4 },
            TrialSpec::Dbscan { eps: 0.8, min_samples: 5 },
        ]
    }

    pub fn validate(&self) -> crate::Result<()> {
        let problem = match self {
            TrialSpec::KMeans {
                clusters, n_runs, ..
            } if *clusters < 2 || *n_runs == 0 => {
                Some("k-means needs at least 2 clusters and 1 run")
            }
            TrialSpec::GaussianMixture { components } if *components < 2 => {
                Some("gaussian mixture needs at least 2 components")
            }
            TrialSpec::Agglomerative { clusters } if *clusters < 2 => {
                Some("agglomerative clustering needs at least 2 clusters")
            }
            TrialSpec::Dbscan { eps, min_samples } if *eps <= 0.0 || *min_samples < 2 => {
                Some("dbscan needs eps > 0 and min_samples >= 2")
            }
            _ => None,
        };
        match problem {
            Some(msg) => Err(SegmentError::InvalidConfig(msg.to_string()).into()),
            None => Ok(()),
        }
    }

    pub fn build(&self, seed: u64) -> Box<dyn ClusterAlgorithm> {
        match self {
            TrialSpec::KMeans {
                clusters,
                n_runs,
                max_iters,
                tolerance,
            } => Box::new(KMeansTrial {
                clusters: *clusters,
                n_runs: *n_runs,
                max_iters: *max_iters,
                tolerance: *tolerance,
                seed,
            }),
            TrialSpec::GaussianMixture { components } => Box::new(GaussianMixtureTrial {
                components: *components,
                seed,
            }),
            TrialSpec::Agglomerative { clusters } => Box::new(AgglomerativeTrial {
                clusters: *clusters,
            }),
            TrialSpec::Dbscan { eps, min_samples } => Box::new(DbscanTrial {
                eps: *eps,
                min_samples: *min_samples,
            }),
        }
    }
}

/// Renumber cluster ids by order of first appearance so equal partitions
/// always carry equal ids. Noise is left as is.
pub fn canonicalize_labels(labels: &[ClusterLabel]) -> Vec<ClusterLabel> {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    labels
        .iter()
        .map(|label| match label {
            ClusterLabel::Noise => ClusterLabel::Noise,
            ClusterLabel::Cluster(id) => {
                let next = mapping.len();
                ClusterLabel::Cluster(*mapping.entry(*id).or_insert(next))
            }
        })
        .collect()
}

/// Mean feature vector of each non-noise cluster, indexed by cluster id.
///
/// Ids with no members get an empty-cluster row of NaN.
pub fn cluster_centroids(features: &Array2<f64>, labels: &[ClusterLabel]) -> Array2<f64> {
    let n_clusters = labels
        .iter()
        .filter_map(|l| match l {
            ClusterLabel::Cluster(id) => Some(id + 1),
            ClusterLabel::Noise => None,
        })
        .max()
        .unwrap_or(0);

    let mut sums = Array2::<f64>::zeros((n_clusters, features.ncols()));
    let mut counts = vec![0usize; n_clusters];
    for (row, label) in features.outer_iter().zip(labels) {
        if let ClusterLabel::Cluster(id) = label {
            let mut target = sums.row_mut(*id);
            target += &row;
            counts[*id] += 1;
        }
    }
    for (mut row, count) in sums.outer_iter_mut().zip(counts) {
        if count == 0 {
            row.fill(f64::NAN);
        } else {
            row /= count as f64;
        }
    }
    sums
}

/// Index of the centroid closest to `point`, ignoring empty clusters
pub fn nearest_centroid(centroids: &Array2<f64>, point: &Array1<f64>) -> Option<usize> {
    centroids
        .outer_iter()
        .enumerate()
        .filter(|(_, c)| c.iter().all(|v| v.is_finite()))
        .map(|(idx, c)| (idx, euclidean_distance(&c, &point.view())))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(idx, _)| idx)
}

/// Calculate Euclidean distance between two points
pub fn euclidean_distance(point1: &ArrayView1<f64>, point2: &ArrayView1<f64>) -> f64 {
    point1
        .iter()
        .zip(point2.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn blobs() -> Array2<f64> {
        array![
            [0.0, 0.0, 0.0],
            [0.1, 0.0, 0.1],
            [0.0, 0.1, 0.0],
            [5.0, 5.0, 5.0],
            [5.1, 5.0, 5.1],
            [5.0, 5.1, 5.0],
            [-5.0, 5.0, -5.0],
            [-5.1, 5.0, -5.1],
            [-5.0, 5.1, -5.0],
        ]
    }

    fn assert_three_blobs(labels: &[ClusterLabel]) {
        assert_eq!(labels.len(), 9);
        for group in labels.chunks(3) {
            assert!(group.iter().all(|l| *l == group[0]));
        }
        assert_ne!(labels[0], labels[3]);
        assert_ne!(labels[3], labels[6]);
        assert_ne!(labels[0], labels[6]);
    }

    #[test]
    fn test_standard_scaler() {
        let data = array![[1.0, 10.0, 5.0], [3.0, 20.0, 5.0]];
        let scaler = StandardScaler::fit(&data).unwrap();
        let scaled = scaler.transform(&data);

        assert!((scaled[[0, 0]] + 1.0).abs() < 1e-12);
        assert!((scaled[[1, 1]] - 1.0).abs() < 1e-12);
        // constant column is centered but not divided by zero
        assert_eq!(scaled[[0, 2]], 0.0);
        assert_eq!(scaler.scales()[2], 1.0);
        assert_eq!(scaler.means().to_vec(), vec![2.0, 15.0, 5.0]);

        let row = scaler.transform_row(&[2.0, 15.0, 5.0]).unwrap();
        assert!(row.iter().all(|v| v.abs() < 1e-12));
        assert!(scaler.transform_row(&[1.0]).is_err());
    }

    #[test]
    fn test_standard_scaler_rejects_empty_input() {
        let data = Array2::<f64>::zeros((0, N_FEATURES));
        assert!(StandardScaler::fit(&data).is_err());
    }

    #[test]
    fn test_fit_kmeans() {
        let trial = TrialSpec::kmeans(3).build(42);
        let labels = trial.fit(&blobs()).unwrap();
        assert_three_blobs(&labels);
        assert!(!trial.supports_noise());
    }

    #[test]
    fn test_kmeans_is_reproducible_with_seed() {
        let trial = TrialSpec::kmeans(3).build(7);
        let a = canonicalize_labels(&trial.fit(&blobs()).unwrap());
        let b = canonicalize_labels(&trial.fit(&blobs()).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_gaussian_mixture_is_reproducible_with_seed() {
        use rand::Rng;

        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let centers = [[0.0, 0.0, 0.0], [6.0, 6.0, 6.0], [-6.0, 6.0, -6.0]];
        let mut raw = Vec::new();
        for center in &centers {
            for _ in 0..15 {
                for c in center {
                    raw.push(c + rng.gen_range(-0.5..0.5));
                }
            }
        }
        let data = Array2::from_shape_vec((45, 3), raw).unwrap();

        let first = TrialSpec::GaussianMixture { components: 3 }.build(42);
        let second = TrialSpec::GaussianMixture { components: 3 }.build(42);
        let a = canonicalize_labels(&first.fit(&data).unwrap());
        let b = canonicalize_labels(&first.fit(&data).unwrap());
        let c = canonicalize_labels(&second.fit(&data).unwrap());
        assert_eq!(a.len(), 45);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_agglomerative_separates_blobs() {
        let labels = AgglomerativeTrial { clusters: 3 }.fit(&blobs()).unwrap();
        assert_three_blobs(&labels);
    }

    #[test]
    fn test_dbscan_marks_outlier_as_noise() {
        let mut rows = blobs().into_raw_vec();
        rows.extend_from_slice(&[50.0, 50.0, 50.0]);
        let data = Array2::from_shape_vec((10, 3), rows).unwrap();

        let trial = DbscanTrial {
            eps: 0.5,
            min_samples: 2,
        };
        let labels = trial.fit(&data).unwrap();
        assert!(trial.supports_noise());
        assert_eq!(labels[9], ClusterLabel::Noise);
        assert!(labels[..9].iter().all(|l| !l.is_noise()));
    }

    #[test]
    fn test_too_few_samples() {
        let data = array![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]];
        let err = TrialSpec::kmeans(4).build(42).fit(&data).unwrap_err();
        assert_eq!(
            err,
            TrialError::TooFewSamples {
                n_samples: 2,
                n_clusters: 4
            }
        );
    }

    #[test]
    fn test_canonicalize_labels() {
        let labels = [
            ClusterLabel::Cluster(2),
            ClusterLabel::Noise,
            ClusterLabel::Cluster(0),
            ClusterLabel::Cluster(2),
        ];
        assert_eq!(
            canonicalize_labels(&labels),
            vec![
                ClusterLabel::Cluster(0),
                ClusterLabel::Noise,
                ClusterLabel::Cluster(1),
                ClusterLabel::Cluster(0),
            ]
        );
    }

    #[test]
    fn test_centroids_and_nearest() {
        let data = array![[0.0, 0.0, 0.0], [2.0, 2.0, 2.0], [10.0, 10.0, 10.0]];
        let labels = [
            ClusterLabel::Cluster(0),
            ClusterLabel::Cluster(0),
            ClusterLabel::Cluster(1),
        ];
        let centroids = cluster_centroids(&data, &labels);

        assert_eq!(centroids.row(0).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(nearest_centroid(&centroids, &array![9.0, 9.0, 9.0]), Some(1));
    }

    #[test]
    fn test_noise_sentinel() {
        assert_eq!(ClusterLabel::Noise.as_i64(), -1);
        assert_eq!(ClusterLabel::from_i64(-1), ClusterLabel::Noise);
        assert_eq!(ClusterLabel::from_i64(3), ClusterLabel::Cluster(3));
    }

    #[test]
    fn test_spec_validation() {
        assert!(TrialSpec::kmeans(1).validate().is_err());
        assert!(TrialSpec::Dbscan {
            eps: 0.0,
            min_samples: 5
        }
        .validate()
        .is_err());
        assert!(TrialSpec::default_suite()
            .iter()
            .all(|spec| spec.validate().is_ok()));
    }
}
