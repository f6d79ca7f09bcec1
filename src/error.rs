//! Typed error conditions raised by the pipeline

use thiserror::Error;

/// Fatal conditions for a segmentation run.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Input file not found: {path}")]
    InputNotFound { path: String },

    #[error("Column for '{canonical}' not found (looked for {candidates:?})")]
    MissingColumn {
        canonical: &'static str,
        candidates: Vec<String>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid prediction input: {0}")]
    InvalidPrediction(String),
}

/// Failure of a single clustering trial. Trials failing this way are
/// excluded from ranking but never abort the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("model fit failed: {0}")]
    Fit(String),

    #[error("{n_samples} samples cannot be split into {n_clusters} clusters")]
    TooFewSamples { n_samples: usize, n_clusters: usize },

    #[error("{n_labels} distinct labels for {n_samples} samples; metrics need between 2 and n-1")]
    DegenerateLabels { n_labels: usize, n_samples: usize },

    #[error("metric '{metric}' is not finite")]
    NonFinite { metric: &'static str },
}
