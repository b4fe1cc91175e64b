//! Error handling.

use crate::config::server::Limit;
use crate::data_portal::PortalError;
use crate::matrix_loader::MatrixDataType;

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_smithy_types::byte_stream::error::Error as ByteStreamError;
use axum::{
    extract::rejection::PathRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tracing::{event, Level};

/// Error raised while building, merging or completing the configuration.
///
/// Configuration errors are fatal at startup. The message identifies the offending field, key or
/// dataroot tag.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    message: String,
}

impl ConfigurationError {
    /// Return a new ConfigurationError with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ConfigurationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::new(format!("invalid configuration: {}", errors))
    }
}

/// Dataset access error type
///
/// This type encapsulates the errors that may occur while resolving or loading a dataset on
/// behalf of a request. Each variant maps onto a 4xx or 5xx API error response; none of them is
/// fatal to the process.
#[derive(Debug, Error)]
pub enum DatasetAccessError {
    /// The data portal could not provide the collection of a dataset
    #[error("unable to retrieve collection {collection_id} from the data portal")]
    CollectionUnavailable {
        collection_id: String,
        #[source]
        source: PortalError,
    },

    /// Dataset name that does not stay within its dataroot
    #[error("invalid dataset path {path}")]
    InvalidDatasetPath { path: String },

    /// Error parsing a dataset schema descriptor
    #[error("dataset schema is not valid")]
    InvalidSchema(#[from] serde_json::Error),

    /// Error reading dataset files
    #[error("error reading dataset")]
    Io(#[from] std::io::Error),

    /// Request is larger than a configured limit
    #[error("request exceeds the {limit} limit ({value} > {max})")]
    LimitExceeded { limit: Limit, value: u64, max: u64 },

    /// A resolved dataset location failed to load
    #[error("dataset {location} could not be loaded")]
    LoadFailed {
        location: String,
        #[source]
        source: Box<DatasetAccessError>,
    },

    /// Matrix type recognised but excluded by the configuration
    #[error("matrix type {matrix_type} is not allowed")]
    MatrixTypeNotAllowed { matrix_type: MatrixDataType },

    /// The data portal holds no record for a dataset
    #[error("no data portal metadata for dataset {dataset}")]
    MetadataNotFound { dataset: String },

    /// Dataset location does not exist
    #[error("dataset not found: {location}")]
    NotFound { location: String },

    /// Error extracting dataset parameters from the request path
    #[error("request path is not valid")]
    PathRejection(#[from] PathRejection),

    /// Error reading object data from S3
    #[error("error receiving object from S3 storage")]
    S3ByteStream(#[from] ByteStreamError),

    /// Error while retrieving an object from S3
    #[error("error retrieving object from S3 storage")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    /// Location whose matrix type cannot be determined
    #[error("unsupported matrix type for {location}")]
    UnsupportedMatrixType { location: String },
}

impl IntoResponse for DatasetAccessError {
    /// Convert from a `DatasetAccessError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    /// Return a new ErrorResponse
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred. This will be formatted into a suitable `ErrorBody`
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }

    /// Return a 400 bad request ErrorResponse
    fn bad_request<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Return a 403 forbidden ErrorResponse
    fn forbidden<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::FORBIDDEN, error)
    }

    /// Return a 404 not found ErrorResponse
    fn not_found<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    /// Return a 500 internal server error ErrorResponse
    fn internal_server_error<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<DatasetAccessError> for ErrorResponse {
    /// Convert from a `DatasetAccessError` into an `ErrorResponse`.
    fn from(error: DatasetAccessError) -> Self {
        let response = match &error {
            // Bad request
            DatasetAccessError::CollectionUnavailable { .. }
            | DatasetAccessError::InvalidDatasetPath { .. }
            | DatasetAccessError::LimitExceeded { .. }
            | DatasetAccessError::MatrixTypeNotAllowed { .. }
            | DatasetAccessError::PathRejection(_)
            | DatasetAccessError::UnsupportedMatrixType { .. } => Self::bad_request(&error),

            // Not found
            DatasetAccessError::LoadFailed { .. }
            | DatasetAccessError::MetadataNotFound { .. }
            | DatasetAccessError::NotFound { .. } => Self::not_found(&error),

            // Internal server error
            DatasetAccessError::InvalidSchema(_)
            | DatasetAccessError::Io(_)
            | DatasetAccessError::S3ByteStream(_) => Self::internal_server_error(&error),

            DatasetAccessError::S3GetObject(sdk_error) => match &sdk_error {
                SdkError::ServiceError(get_obj_error) => {
                    let get_obj_error = get_obj_error.err();
                    match get_obj_error {
                        GetObjectError::NoSuchKey(_) => Self::not_found(&error),
                        _ => match get_obj_error.code() {
                            Some("NoSuchBucket") => Self::not_found(&error),
                            Some("InvalidAccessKeyId")
                            | Some("SignatureDoesNotMatch")
                            | Some("AccessDenied") => Self::forbidden(&error),
                            _ => Self::internal_server_error(&error),
                        },
                    }
                }
                _ => Self::internal_server_error(&error),
            },
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
