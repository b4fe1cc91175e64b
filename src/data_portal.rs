//! Data portal metadata API client.
//!
//! The data portal knows where the published datasets live, which collection they belong to and
//! whether they have been withdrawn (tombstoned). [DataPortal] is the seam used by the resolver;
//! [DataPortalClient] implements it over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use url::Url;

/// Visibility of a collection in the data portal.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum CollectionVisibility {
    Public,
    Private,
}

/// Portal record of a dataset.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DatasetMetadata {
    pub collection_id: String,
    pub collection_visibility: CollectionVisibility,
    pub dataset_id: String,
    /// Storage location of the dataset.
    #[serde(default)]
    pub s3_uri: Option<String>,
    /// Whether the dataset has been withdrawn.
    #[serde(default)]
    pub tombstoned: bool,
}

impl DatasetMetadata {
    /// URL of the collection page on the web client.
    pub fn collection_url(&self, web_base_url: &str) -> String {
        let private = match self.collection_visibility {
            CollectionVisibility::Private => "/private",
            CollectionVisibility::Public => "",
        };
        format!(
            "{}/collections/{}{}",
            web_base_url.trim_end_matches('/'),
            self.collection_id,
            private
        )
    }

    /// URL that a request for a tombstoned dataset is redirected to.
    pub fn tombstone_redirect_url(&self, web_base_url: &str) -> String {
        format!(
            "{}?tombstoned_dataset_id={}",
            self.collection_url(web_base_url),
            self.dataset_id
        )
    }
}

/// Portal record of a collection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub description: String,
    pub contact_email: String,
    pub contact_name: String,
    pub links: Vec<Value>,
    pub datasets: Vec<Value>,
}

impl Collection {
    /// Name of a dataset in this collection.
    pub fn dataset_name(&self, dataset_id: &str) -> Option<&str> {
        self.datasets
            .iter()
            .find(|dataset| dataset.get("id").and_then(Value::as_str) == Some(dataset_id))
            .and_then(|dataset| dataset.get("name"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("data portal request failed")]
    Request(#[from] reqwest::Error),

    #[error("data portal responded with status {0}")]
    Status(u16),

    #[error("invalid data portal URL")]
    Url(#[from] url::ParseError),
}

/// Data portal metadata API.
#[async_trait]
pub trait DataPortal: Send + Sync {
    /// Look up the record of the dataset published at `dataset_url`.
    ///
    /// Returns `None` when the portal has no usable record.
    async fn dataset_metadata(&self, dataset_url: &str) -> Result<Option<DatasetMetadata>, PortalError>;

    /// Fetch a collection.
    async fn collection(
        &self,
        collection_id: &str,
        visibility: CollectionVisibility,
    ) -> Result<Collection, PortalError>;
}

/// HTTP client of the data portal API.
#[derive(Debug)]
pub struct DataPortalClient {
    reqwest_client: reqwest::Client,
    api_base: Url,
}

impl DataPortalClient {
    /// Create a new data portal client.
    ///
    /// # Arguments
    ///
    /// * `api_base`: Base URL of the API. `https://` is assumed when no scheme is given.
    /// * `timeout`: Timeout of each request
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, PortalError> {
        let api_base = if api_base.contains("://") {
            api_base.to_string()
        } else {
            format!("https://{}", api_base)
        };
        let api_base = Url::parse(api_base.trim_end_matches('/'))?;
        let reqwest_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            reqwest_client,
            api_base,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PortalError> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.api_base.as_str().trim_end_matches('/'),
            path
        ))?)
    }
}

#[async_trait]
impl DataPortal for DataPortalClient {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn dataset_metadata(&self, dataset_url: &str) -> Result<Option<DatasetMetadata>, PortalError> {
        let response = self
            .reqwest_client
            .get(self.endpoint("datasets/meta")?)
            .query(&[("url", dataset_url)])
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::debug!(
                "data portal has no record of {} (status {})",
                dataset_url,
                response.status()
            );
            return Ok(None);
        }
        match response.json::<DatasetMetadata>().await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) => {
                tracing::warn!("malformed data portal record for {}: {}", dataset_url, err);
                Ok(None)
            }
        }
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn collection(
        &self,
        collection_id: &str,
        visibility: CollectionVisibility,
    ) -> Result<Collection, PortalError> {
        let response = self
            .reqwest_client
            .get(self.endpoint(&format!("collections/{}", collection_id))?)
            .query(&[("visibility", visibility.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PortalError::Status(response.status().as_u16()));
        }
        Ok(response.json::<Collection>().await?)
    }
}
