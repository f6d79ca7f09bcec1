//! Command-line interface definitions and argument parsing

use crate::config::{ClusterSource, PipelineConfig};
use crate::model::TrialSpec;
use clap::Parser;
use std::path::PathBuf;

/// Customer segmentation CLI: RFM scores, segments and cluster comparison
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transaction CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: PathBuf,

    /// Output path for the segmentation table
    #[arg(short, long, default_value = "rfm_segments.csv")]
    pub output: PathBuf,

    /// Write the model comparison report here (.json for JSON, Markdown otherwise)
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Write per-segment summary statistics here
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Write SVG charts; the segment chart goes next to it with a `_segments` suffix,
    /// and with `--compare` a model comparison grid with a `_comparison` suffix
    #[arg(long)]
    pub plot: Option<PathBuf>,

    /// JSON pipeline configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of clusters for the primary K-Means model
    #[arg(short = 'k', long)]
    pub clusters: Option<usize>,

    /// Seed for randomly initialised models
    #[arg(long)]
    pub seed: Option<u64>,

    /// Maximum iterations for K-Means (default 300)
    #[arg(long)]
    pub max_iters: Option<u64>,

    /// Tolerance for K-Means convergence (default 1e-4)
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Run the clustering model comparison
    #[arg(long)]
    pub compare: bool,

    /// Take cluster assignments from the recommended model (implies --compare)
    #[arg(long)]
    pub use_recommended: bool,

    /// Prediction mode: provide R,F,M values as comma-separated string
    /// Example: --predict "30,10,500.0" for Recency=30, Frequency=10, Monetary=500.0
    #[arg(short, long)]
    pub predict: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Parse RFM values from the predict string
    /// Expected format: "recency,frequency,monetary"
    pub fn parse_rfm_values(&self) -> crate::Result<Option<(f64, f64, f64)>> {
        let Some(ref predict_str) = self.predict else {
            return Ok(None);
        };

        let parts: Vec<&str> = predict_str.split(',').collect();
        if parts.len() != 3 {
            anyhow::bail!("Predict values must be in format 'recency,frequency,monetary'");
        }

        let parse = |name: &str, raw: &str| -> crate::Result<f64> {
            raw.trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", name, raw))
        };
        Ok(Some((
            parse("recency", parts[0])?,
            parse("frequency", parts[1])?,
            parse("monetary", parts[2])?,
        )))
    }

    /// Load the configuration file, if any, and apply flag overrides on top.
    pub fn pipeline_config(&self) -> crate::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(clusters) = self.clusters {
            config.primary_model = TrialSpec::kmeans(clusters);
        }
        if let TrialSpec::KMeans {
            max_iters,
            tolerance,
            ..
        } = &mut config.primary_model
        {
            if let Some(value) = self.max_iters {
                *max_iters = value;
            }
            if let Some(value) = self.tolerance {
                *tolerance = value;
            }
        }
        if self.compare || self.use_recommended {
            config.compare = true;
        }
        if self.use_recommended {
            config.cluster_source = ClusterSource::Recommended;
        }

        config.validate()?;
        Ok(config)
    }
}
