//! API response bodies

use crate::config::dataset::{DatasetConfig, XApproximateDistribution};
use crate::config::server::ServerConfig;
use crate::data_portal::{Collection, DatasetMetadata};

use serde::Serialize;
use serde_json::Value;

/// Health check response
#[derive(Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Response of the `config` endpoint
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub config: ClientConfig,
}

/// Configuration of the web client for a dataset
#[derive(Debug, Serialize)]
pub struct ClientConfig {
    #[serde(rename = "displayNames")]
    pub display_names: DisplayNames,
    pub links: Links,
    pub parameters: Parameters,
    pub library_versions: LibraryVersions,
}

#[derive(Debug, Serialize)]
pub struct DisplayNames {
    pub dataset: String,
}

#[derive(Debug, Serialize)]
pub struct Links {
    #[serde(rename = "collections-home-page")]
    pub collections_home_page: Option<String>,
    #[serde(rename = "about-dataset")]
    pub about_dataset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Parameters {
    #[serde(rename = "max-category-items")]
    pub max_category_items: u64,
    #[serde(rename = "disable-diffexp")]
    pub disable_diffexp: bool,
    pub diffexp_lfc_cutoff: f64,
    pub diffexp_top_n: u64,
    pub diffexp_cellcount_max: Option<u64>,
    pub column_request_max: Option<u64>,
    pub custom_colors: bool,
    pub x_approximate_distribution: XApproximateDistribution,
    pub about_legal_tos: Option<String>,
    pub about_legal_privacy: Option<String>,
    pub embeddings: Vec<String>,
    pub obs_names: Option<String>,
    pub var_names: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LibraryVersions {
    #[serde(rename = "cellxgene-server")]
    pub server: &'static str,
}

impl ClientConfig {
    /// Build the client configuration of a dataset.
    ///
    /// # Arguments
    ///
    /// * `server`: Completed server configuration
    /// * `dataset_config`: Effective configuration of the dataset
    /// * `dataset_name`: Name shown to users
    pub fn new(server: &ServerConfig, dataset_config: &DatasetConfig, dataset_name: String) -> Self {
        Self {
            display_names: DisplayNames {
                dataset: dataset_name,
            },
            links: Links {
                collections_home_page: server.get_web_base_url(),
                about_dataset: server.single_dataset.about.clone(),
            },
            parameters: Parameters {
                max_category_items: dataset_config.presentation.max_categories,
                disable_diffexp: !dataset_config.diffexp.enable,
                diffexp_lfc_cutoff: dataset_config.diffexp.lfc_cutoff,
                diffexp_top_n: dataset_config.diffexp.top_n,
                diffexp_cellcount_max: server.limits.diffexp_cellcount_max,
                column_request_max: server.limits.column_request_max,
                custom_colors: dataset_config.presentation.custom_colors,
                x_approximate_distribution: dataset_config.x_approximate_distribution,
                about_legal_tos: dataset_config.app.about_legal_tos.clone(),
                about_legal_privacy: dataset_config.app.about_legal_privacy.clone(),
                embeddings: dataset_config.embeddings.names.clone(),
                obs_names: server.single_dataset.obs_names.clone(),
                var_names: server.single_dataset.var_names.clone(),
            },
            library_versions: LibraryVersions {
                server: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

/// Response of the `schema` endpoint
#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub schema: Value,
}

/// Response of the `dataset-metadata` endpoint
#[derive(Debug, Serialize)]
pub struct DatasetMetadataResponse {
    pub metadata: DatasetMetadataBody,
}

/// Portal metadata of a dataset and its collection
#[derive(Debug, PartialEq, Serialize)]
pub struct DatasetMetadataBody {
    pub dataset_name: Option<String>,
    pub dataset_id: String,
    pub collection_url: String,
    pub collection_name: String,
    pub collection_contact_email: String,
    pub collection_contact_name: String,
    pub collection_description: String,
    pub collection_links: Vec<Value>,
    pub collection_datasets: Vec<Value>,
}

impl DatasetMetadataBody {
    pub fn new(metadata: &DatasetMetadata, collection: Collection, web_base_url: &str) -> Self {
        Self {
            dataset_name: collection
                .dataset_name(&metadata.dataset_id)
                .map(str::to_string),
            dataset_id: metadata.dataset_id.clone(),
            collection_url: metadata.collection_url(web_base_url),
            collection_name: collection.name,
            collection_contact_email: collection.contact_email,
            collection_contact_name: collection.contact_name,
            collection_description: collection.description,
            collection_links: collection.links,
            collection_datasets: collection.datasets,
        }
    }
}
