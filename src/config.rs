//! Pipeline configuration, loadable from a JSON file

use crate::error::SegmentError;
use crate::model::TrialSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Seed used by every randomly initialised model unless overridden.
pub const DEFAULT_SEED: u64 = 42;

/// Source column names for each canonical transaction field.
///
/// When a configured source column is absent the loader falls back to the
/// canonical name (`id`, `monetary`, `units`, `date`, `country`), so already
/// normalized files load without a custom mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub id: String,
    pub monetary: String,
    pub units: String,
    pub date: String,
    pub country: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            id: "Customer_ID".to_string(),
            monetary: "Sales_Amount".to_string(),
            units: "Quantity_Sold".to_string(),
            date: "Sale_Date".to_string(),
            country: "Region".to_string(),
        }
    }
}

/// Which model supplies the `cluster` column of the output table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSource {
    /// The configured primary model.
    #[default]
    Primary,
    /// The comparison's recommended trial; falls back to the primary model
    /// when comparison is disabled or every trial errored.
    Recommended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub columns: ColumnMapping,
    pub seed: u64,
    pub primary_model: TrialSpec,
    pub compare: bool,
    pub trials: Vec<TrialSpec>,
    pub cluster_source: ClusterSource,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            columns: ColumnMapping::default(),
            seed: DEFAULT_SEED,
            primary_model: TrialSpec::kmeans(4),
            compare: false,
            trials: TrialSpec::default_suite(),
            cluster_source: ClusterSource::Primary,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|_| SegmentError::InputNotFound {
            path: path.display().to_string(),
        })?;
        let config: PipelineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.primary_model.validate()?;
        for trial in &self.trials {
            trial.validate()?;
        }
        if self.compare && self.trials.is_empty() {
            return Err(SegmentError::InvalidConfig(
                "comparison enabled but no trials configured".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
