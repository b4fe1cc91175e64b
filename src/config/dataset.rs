//! Per-dataset configuration.

use crate::error::ConfigurationError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use validator::Validate;

/// Presentation and feature settings applied to a dataset.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct DatasetConfig {
    pub app: DatasetAppSettings,
    #[validate]
    pub presentation: PresentationSettings,
    pub embeddings: EmbeddingSettings,
    #[validate]
    pub diffexp: DatasetDiffexpSettings,
    pub x_approximate_distribution: XApproximateDistribution,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DatasetAppSettings {
    /// Script URLs injected into the client page.
    pub scripts: Vec<String>,
    pub inline_scripts: Vec<String>,
    pub about_legal_tos: Option<String>,
    pub about_legal_privacy: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct PresentationSettings {
    /// Categories with more values than this are not shown.
    #[validate(range(min = 1, message = "max_categories must be greater than 0"))]
    pub max_categories: u64,
    pub custom_colors: bool,
}

impl Default for PresentationSettings {
    fn default() -> Self {
        Self {
            max_categories: 1000,
            custom_colors: true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EmbeddingSettings {
    /// Embeddings to show. Empty shows all.
    pub names: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct DatasetDiffexpSettings {
    pub enable: bool,
    #[validate(range(min = 0.0, message = "lfc_cutoff must not be negative"))]
    pub lfc_cutoff: f64,
    #[validate(range(min = 1, message = "top_n must be greater than 0"))]
    pub top_n: u64,
}

impl Default for DatasetDiffexpSettings {
    fn default() -> Self {
        Self {
            enable: true,
            lfc_cutoff: 0.01,
            top_n: 10,
        }
    }
}

/// Approximate distribution of the expression matrix values.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum XApproximateDistribution {
    /// Inferred from the data.
    #[default]
    Auto,
    Normal,
    Count,
}

impl DatasetConfig {
    /// Deserialise a merged configuration tree.
    pub(crate) fn from_tree(tree: &Value) -> Result<Self, ConfigurationError> {
        serde_json::from_value(tree.clone()).map_err(|err| {
            ConfigurationError::new(format!("Invalid dataset configuration: {}", err))
        })
    }

    pub fn complete_config(&self) -> Result<(), ConfigurationError> {
        self.validate()?;
        Ok(())
    }
}
