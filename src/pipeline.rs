//! End-to-end segmentation run: load, aggregate, score, classify, cluster

use crate::config::{ClusterSource, PipelineConfig};
use crate::data::{load_transactions, LoadReport, LoadedTransactions};
use crate::error::SegmentError;
use crate::evaluate::{run_trial, run_trials, ComparisonReport, TrialOutcome};
use crate::model::{
    canonicalize_labels, cluster_centroids, feature_matrix, nearest_centroid, ClusterLabel,
    StandardScaler, TrialSpec,
};
use crate::rfm::aggregate;
use crate::scoring::{score_all, QuintileBoundaries, RfmScores};
use crate::segment::{Segment, SegmentClassifier, SegmentedRecord};
use log::{info, warn};
use ndarray::Array2;
use polars::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::Path;

/// A segmented customer with its cluster assignment, if clustering ran
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredRecord {
    pub segmented: SegmentedRecord,
    pub cluster: Option<ClusterLabel>,
}

/// One row of the output table.
///
/// `cluster` is `-1` for noise and empty when clustering was skipped or
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationRow {
    pub id: String,
    pub country: String,
    pub recency: i64,
    pub frequency: u64,
    pub monetary: f64,
    pub r: u8,
    pub f: u8,
    pub m: u8,
    pub rfm_score: String,
    pub fm: u8,
    pub segment: String,
    pub cluster: Option<i64>,
}

impl From<&ClusteredRecord> for SegmentationRow {
    fn from(record: &ClusteredRecord) -> Self {
        let scored = &record.segmented.scored;
        Self {
            id: scored.rfm.key.customer_id.clone(),
            country: scored.rfm.key.country.clone(),
            recency: scored.rfm.recency,
            frequency: scored.rfm.frequency,
            monetary: scored.rfm.monetary,
            r: scored.scores.r,
            f: scored.scores.f,
            m: scored.scores.m,
            rfm_score: scored.scores.rfm_score(),
            fm: scored.scores.fm,
            segment: record.segmented.segment.to_string(),
            cluster: record.cluster.map(ClusterLabel::as_i64),
        }
    }
}

/// Scores, segment and cluster for a customer outside the fitted table
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerScore {
    pub scores: RfmScores,
    pub segment: Segment,
    pub cluster: Option<usize>,
}

/// Scores new (recency, frequency, monetary) triples against a finished run
#[derive(Debug, Clone)]
pub struct CustomerScorer {
    boundaries: QuintileBoundaries,
    classifier: SegmentClassifier,
    scaler: Option<StandardScaler>,
    centroids: Option<Array2<f64>>,
}

impl CustomerScorer {
    pub fn boundaries(&self) -> &QuintileBoundaries {
        &self.boundaries
    }

    /// Cluster centroids in standardized feature space, if clustering ran
    pub fn centroids(&self) -> Option<&Array2<f64>> {
        self.centroids.as_ref()
    }

    pub fn score(&self, recency: f64, frequency: f64, monetary: f64) -> crate::Result<CustomerScore> {
        if !(recency.is_finite() && frequency.is_finite() && monetary.is_finite()) {
            return Err(SegmentError::InvalidPrediction(
                "recency, frequency and monetary must be finite".to_string(),
            )
            .into());
        }
        if recency < 0.0 || frequency < 0.0 {
            return Err(SegmentError::InvalidPrediction(
                "recency and frequency cannot be negative".to_string(),
            )
            .into());
        }

        let scores = self.boundaries.score(recency, frequency, monetary);
        let segment = self.classifier.classify(scores.r, scores.fm);
        let cluster = match (&self.scaler, &self.centroids) {
            (Some(scaler), Some(centroids)) => {
                let point = scaler.transform_row(&[recency, frequency, monetary])?;
                nearest_centroid(centroids, &point)
            }
            _ => None,
        };

        Ok(CustomerScore {
            scores,
            segment,
            cluster,
        })
    }
}

/// Everything a run produces
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub load_report: LoadReport,
    pub boundaries: Option<QuintileBoundaries>,
    pub records: Vec<ClusteredRecord>,
    pub comparison: Option<ComparisonReport>,
    pub scorer: Option<CustomerScorer>,
    /// Standardized (recency, frequency, monetary) rows, if clustering ran
    pub features: Option<Array2<f64>>,
    /// Every comparison trial with its labels, in suite order
    pub trials: Vec<TrialOutcome>,
}

impl PipelineOutput {
    pub fn rows(&self) -> Vec<SegmentationRow> {
        self.records.iter().map(SegmentationRow::from).collect()
    }

    /// Customers per cluster label, noise included
    pub fn cluster_sizes(&self) -> Vec<(ClusterLabel, usize)> {
        let mut sizes = std::collections::BTreeMap::new();
        for label in self.records.iter().filter_map(|r| r.cluster) {
            *sizes.entry(label).or_insert(0usize) += 1;
        }
        sizes.into_iter().collect()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    classifier: SegmentClassifier,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier: SegmentClassifier::new()?,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run_file(&self, path: impl AsRef<Path>) -> crate::Result<PipelineOutput> {
        let loaded = load_transactions(path, &self.config.columns)?;
        self.run_transactions(loaded)
    }

    pub fn run_transactions(&self, loaded: LoadedTransactions) -> crate::Result<PipelineOutput> {
        let rfm = aggregate(&loaded.records);
        let raw = feature_matrix(&rfm);
        let (boundaries, scored) = score_all(rfm);
        let segmented = self.classifier.classify_all(scored);

        let mut comparison = None;
        let mut labels = None;
        let mut scaler = None;
        let mut centroids = None;
        let mut scaled = None;
        let mut trials = Vec::new();

        if segmented.len() < 2 {
            info!(
                "Skipping clustering: {} customer(s) is too few",
                segmented.len()
            );
        } else {
            let fitted = StandardScaler::fit(&raw)?;
            let features = fitted.transform(&raw);

            let outcomes = if self.config.compare {
                let algorithms: Vec<_> = self
                    .config
                    .trials
                    .iter()
                    .map(|spec| spec.build(self.config.seed))
                    .collect();
                info!("Comparing {} clustering trials", algorithms.len());
                let outcomes = run_trials(&features, &algorithms);
                comparison = Some(ComparisonReport::from_outcomes(&outcomes));
                outcomes
            } else {
                Vec::new()
            };

            labels = self.assign_clusters(&features, &outcomes, comparison.as_ref());
            centroids = labels
                .as_deref()
                .map(|l: &[ClusterLabel]| cluster_centroids(&features, l));
            scaler = Some(fitted);
            scaled = Some(features);
            trials = outcomes;
        }

        let records = match labels {
            Some(labels) => segmented
                .into_iter()
                .zip(labels)
                .map(|(segmented, label)| ClusteredRecord {
                    segmented,
                    cluster: Some(label),
                })
                .collect(),
            None => segmented
                .into_iter()
                .map(|segmented| ClusteredRecord {
                    segmented,
                    cluster: None,
                })
                .collect(),
        };

        let scorer = boundaries.clone().map(|boundaries| CustomerScorer {
            boundaries,
            classifier: self.classifier.clone(),
            scaler,
            centroids,
        });

        Ok(PipelineOutput {
            load_report: loaded.report,
            boundaries,
            records,
            comparison,
            scorer,
            features: scaled,
            trials,
        })
    }

    /// Outcomes of the four models drawn in the comparison chart. Trials
    /// already run by the comparison are reused; the rest are fitted here.
    pub fn comparison_panels(&self, output: &PipelineOutput) -> Vec<TrialOutcome> {
        let Some(features) = output.features.as_ref() else {
            return Vec::new();
        };
        TrialSpec::comparison_panels()
            .iter()
            .map(|spec| {
                let algorithm = spec.build(self.config.seed);
                let name = algorithm.name();
                output
                    .trials
                    .iter()
                    .find(|o| o.algorithm_name == name)
                    .cloned()
                    .unwrap_or_else(|| run_trial(features, algorithm.as_ref()))
            })
            .collect()
    }

    fn assign_clusters(
        &self,
        features: &Array2<f64>,
        outcomes: &[TrialOutcome],
        comparison: Option<&ComparisonReport>,
    ) -> Option<Vec<ClusterLabel>> {
        if self.config.cluster_source == ClusterSource::Recommended {
            let recommended = comparison
                .and_then(|report| report.recommended.as_deref())
                .and_then(|name| {
                    outcomes
                        .iter()
                        .find(|o| o.algorithm_name == name)
                        .and_then(|o| o.result.as_ref().ok())
                });
            match recommended {
                Some(result) => {
                    info!("Using clusters from {}", result.algorithm_name);
                    return Some(result.labels.clone());
                }
                None => warn!("No recommended trial available, using the primary model"),
            }
        }

        let model = self.config.primary_model.build(self.config.seed);
        match model.fit(features) {
            Ok(labels) => {
                info!("Assigned clusters with {}", model.name());
                Some(canonicalize_labels(&labels))
            }
            Err(e) => {
                warn!("{} failed, leaving clusters empty: {}", model.name(), e);
                None
            }
        }
    }
}

/// Write the output table as CSV. Missing clusters become empty cells.
pub fn write_segmentation_csv(rows: &[SegmentationRow], path: impl AsRef<Path>) -> crate::Result<()> {
    let path = path.as_ref();
    let mut df = DataFrame::new(vec![
        Series::new("id", rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>()),
        Series::new("country", rows.iter().map(|r| r.country.as_str()).collect::<Vec<_>>()),
        Series::new("recency", rows.iter().map(|r| r.recency).collect::<Vec<_>>()),
        Series::new("frequency", rows.iter().map(|r| r.frequency).collect::<Vec<_>>()),
        Series::new("monetary", rows.iter().map(|r| r.monetary).collect::<Vec<_>>()),
        Series::new("r", rows.iter().map(|r| r.r as u32).collect::<Vec<_>>()),
        Series::new("f", rows.iter().map(|r| r.f as u32).collect::<Vec<_>>()),
        Series::new("m", rows.iter().map(|r| r.m as u32).collect::<Vec<_>>()),
        Series::new("rfm_score", rows.iter().map(|r| r.rfm_score.as_str()).collect::<Vec<_>>()),
        Series::new("fm", rows.iter().map(|r| r.fm as u32).collect::<Vec<_>>()),
        Series::new("segment", rows.iter().map(|r| r.segment.as_str()).collect::<Vec<_>>()),
        Series::new("cluster", rows.iter().map(|r| r.cluster).collect::<Vec<_>>()),
    ])?;

    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)?;
    info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

fn text_column(df: &DataFrame, name: &str) -> crate::Result<Vec<Option<String>>> {
    Ok(df
        .column(name)?
        .cast(&DataType::String)?
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        .collect())
}

fn parse_cell<T: std::str::FromStr>(value: Option<&String>, column: &str, row: usize) -> crate::Result<T> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("Invalid {} value at row {}: {:?}", column, row, value))
}

/// Read an output table written by [`write_segmentation_csv`].
///
/// Every column is read as text so ids keep their exact form.
pub fn read_segmentation_csv(path: impl AsRef<Path>) -> crate::Result<Vec<SegmentationRow>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SegmentError::InputNotFound {
            path: path.display().to_string(),
        }
        .into());
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let columns = [
        "id", "country", "recency", "frequency", "monetary", "r", "f", "m", "rfm_score", "fm",
        "segment", "cluster",
    ];
    let cols = columns
        .iter()
        .map(|name| text_column(&df, name))
        .collect::<crate::Result<Vec<_>>>()?;

    (0..df.height())
        .map(|row| {
            let cell = |idx: usize| cols[idx][row].as_ref();
            Ok(SegmentationRow {
                id: cell(0).cloned().unwrap_or_default(),
                country: cell(1).cloned().unwrap_or_default(),
                recency: parse_cell(cell(2), "recency", row)?,
                frequency: parse_cell(cell(3), "frequency", row)?,
                monetary: parse_cell(cell(4), "monetary", row)?,
                r: parse_cell(cell(5), "r", row)?,
                f: parse_cell(cell(6), "f", row)?,
                m: parse_cell(cell(7), "m", row)?,
                rfm_score: cell(8).cloned().unwrap_or_default(),
                fm: parse_cell(cell(9), "fm", row)?,
                segment: cell(10).cloned().unwrap_or_default(),
                cluster: cell(11).map(|v| parse_cell(Some(v), "cluster", row)).transpose()?,
            })
        })
        .collect()
}
