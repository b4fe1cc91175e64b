//! Axum extractor identifying the dataset a request is for.

use crate::error::DatasetAccessError;
use crate::metadata_cache::DatasetKey;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path},
    http::request::Parts,
};

/// Dataset routing information attached to a group of routes as a request extension.
#[derive(Clone, Debug)]
pub enum DatasetRoute {
    /// Routes below a dataroot's base URL. The dataset name is the `dataset` path parameter.
    Dataroot { tag: String },
    /// Routes serving the single configured dataset.
    Single { dataset: String },
}

/// An axum extractor producing the [DatasetKey] of a request.
#[derive(Debug, Clone)]
pub struct DatasetRequest(pub DatasetKey);

#[async_trait]
impl<S> FromRequestParts<S> for DatasetRequest
where
    S: Send + Sync,
{
    type Rejection = DatasetAccessError;

    /// Extract a `DatasetRequest` from request parts.
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<DatasetRoute>().cloned() {
            Some(DatasetRoute::Dataroot { tag }) => {
                let Path(dataset) = Path::<String>::from_request_parts(parts, state).await?;
                Ok(DatasetRequest(DatasetKey {
                    tag: Some(tag),
                    dataset,
                }))
            }
            Some(DatasetRoute::Single { dataset }) => {
                Ok(DatasetRequest(DatasetKey { tag: None, dataset }))
            }
            None => Err(DatasetAccessError::NotFound {
                location: parts.uri.path().to_string(),
            }),
        }
    }
}
