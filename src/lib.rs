//! SegmentForge: customer segmentation from transaction history
//!
//! Transactions are aggregated into per-customer Recency, Frequency and
//! Monetary (RFM) metrics, scored into quintiles, mapped to business segments
//! and optionally clustered. Competing clustering models can be compared on
//! internal validity metrics to pick the most coherent partition.

pub mod cli;
pub mod config;
pub mod dashboard;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod hierarchical;
pub mod model;
pub mod pipeline;
pub mod rfm;
pub mod scoring;
pub mod segment;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use config::{ClusterSource, ColumnMapping, PipelineConfig};
pub use dashboard::{Filter, HistogramBin, SegmentationView, ViewHandle};
pub use data::{load_transactions, LoadReport, TransactionRecord};
pub use error::{SegmentError, TrialError};
pub use evaluate::{evaluate_labels, run_trials, ComparisonReport, ValidityMetrics};
pub use model::{ClusterAlgorithm, ClusterLabel, TrialSpec};
pub use pipeline::{
    read_segmentation_csv, write_segmentation_csv, CustomerScorer, Pipeline, PipelineOutput,
    SegmentationRow,
};
pub use rfm::{aggregate, CustomerKey, RfmRecord};
pub use scoring::{QuintileBoundaries, RfmScores};
pub use segment::{Segment, SegmentClassifier};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
