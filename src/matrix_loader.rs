//! Matrix dataset locations, pre-load validation and schema loading.

use crate::error::DatasetAccessError;
use crate::s3_client::{parse_s3_uri, S3ClientMap, S3Credentials, DEFAULT_REGION};

use axum::body::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum_macros::Display;

/// Supported matrix formats.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MatrixDataType {
    /// CXG (TileDB) directory
    Cxg,
    /// AnnData file
    H5ad,
}

impl FromStr for MatrixDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cxg" => Ok(Self::Cxg),
            "h5ad" => Ok(Self::H5ad),
            _ => Err(format!("unknown matrix type {}", s)),
        }
    }
}

impl MatrixDataType {
    /// Infer the matrix type of a location from its extension.
    pub fn from_location(location: &str) -> Option<Self> {
        let location = location.trim_end_matches('/');
        if location.ends_with(".cxg") {
            Some(Self::Cxg)
        } else if location.ends_with(".h5ad") {
            Some(Self::H5ad)
        } else {
            None
        }
    }
}

/// Parsed dataset location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataLocation {
    Local(PathBuf),
    S3 { bucket: String, key: String },
}

impl DataLocation {
    /// Parse an `s3://` URI or a local path, expanding `~`.
    pub fn parse(location: &str) -> Result<Self, DatasetAccessError> {
        if location.starts_with("s3://") {
            let (bucket, key) =
                parse_s3_uri(location).ok_or_else(|| DatasetAccessError::InvalidDatasetPath {
                    path: location.to_string(),
                })?;
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                key: key.trim_end_matches('/').to_string(),
            });
        }
        let path = expanduser::expanduser(location).map_err(|_| {
            DatasetAccessError::InvalidDatasetPath {
                path: location.to_string(),
            }
        })?;
        Ok(Self::Local(path))
    }
}

/// Loader of a single matrix dataset.
#[derive(Clone, Debug)]
pub struct MatrixDataLoader {
    location: String,
    data_location: DataLocation,
    matrix_type: Option<MatrixDataType>,
}

impl MatrixDataLoader {
    pub fn new(location: &str) -> Result<Self, DatasetAccessError> {
        Ok(Self {
            location: location.to_string(),
            data_location: DataLocation::parse(location)?,
            matrix_type: MatrixDataType::from_location(location),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn matrix_type(&self) -> Option<MatrixDataType> {
        self.matrix_type
    }

    /// Final component of the location.
    pub fn basename(&self) -> &str {
        basename(&self.location)
    }

    /// Name of the dataset shown to users: the basename without its extension.
    pub fn display_name(&self) -> &str {
        display_name(&self.location)
    }

    /// Check that the dataset can be loaded.
    ///
    /// # Arguments
    ///
    /// * `allowed`: Matrix types that may be loaded. Empty allows every type.
    pub fn pre_load_validation(&self, allowed: &[MatrixDataType]) -> Result<(), DatasetAccessError> {
        let matrix_type =
            self.matrix_type
                .ok_or_else(|| DatasetAccessError::UnsupportedMatrixType {
                    location: self.location.clone(),
                })?;
        if !allowed.is_empty() && !allowed.contains(&matrix_type) {
            return Err(DatasetAccessError::MatrixTypeNotAllowed { matrix_type });
        }
        if let DataLocation::Local(path) = &self.data_location {
            if !path.exists() {
                return Err(DatasetAccessError::NotFound {
                    location: self.location.clone(),
                });
            }
        }
        Ok(())
    }

    /// Size of the dataset in bytes. Objects in S3 are not measured.
    pub fn file_size(&self) -> Result<u64, DatasetAccessError> {
        match &self.data_location {
            DataLocation::Local(path) => Ok(disk_usage(path)?),
            DataLocation::S3 { .. } => Ok(0),
        }
    }

    /// Location of the schema descriptor of the dataset.
    fn schema_location(&self, matrix_type: MatrixDataType) -> DataLocation {
        match (&self.data_location, matrix_type) {
            (DataLocation::Local(path), MatrixDataType::Cxg) => {
                DataLocation::Local(path.join("schema.json"))
            }
            (DataLocation::Local(path), MatrixDataType::H5ad) => {
                let mut path = path.clone().into_os_string();
                path.push(".schema.json");
                DataLocation::Local(path.into())
            }
            (DataLocation::S3 { bucket, key }, MatrixDataType::Cxg) => DataLocation::S3 {
                bucket: bucket.clone(),
                key: format!("{}/schema.json", key),
            },
            (DataLocation::S3 { bucket, key }, MatrixDataType::H5ad) => DataLocation::S3 {
                bucket: bucket.clone(),
                key: format!("{}.schema.json", key),
            },
        }
    }
}

/// Final component of a location.
pub fn basename(location: &str) -> &str {
    let location = location.trim_end_matches('/');
    location.rsplit('/').next().unwrap_or(location)
}

/// Basename of a location without its extension.
pub fn display_name(location: &str) -> &str {
    let name = basename(location);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Total size of a file, or of every file below a directory.
fn disk_usage(path: &Path) -> std::io::Result<u64> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut size = 0;
    for entry in std::fs::read_dir(path)? {
        size += disk_usage(&entry?.path())?;
    }
    Ok(size)
}

/// A loaded dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct MatrixDataset {
    pub location: String,
    /// Name shown to users.
    pub name: String,
    pub matrix_type: MatrixDataType,
    /// Schema descriptor of the dataset.
    pub schema: Value,
}

/// Opens datasets from local storage or S3.
pub struct MatrixStore {
    s3_clients: S3ClientMap,
    /// Object store region from the adaptor context.
    region: Option<String>,
    /// Matrix types that may be served. Empty allows every type.
    allowed: Vec<MatrixDataType>,
}

impl MatrixStore {
    pub fn new(region: Option<String>, allowed: Vec<MatrixDataType>) -> Self {
        Self {
            s3_clients: S3ClientMap::new(),
            region,
            allowed,
        }
    }

    /// Validate and open the dataset at a location.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn open(&self, location: &str) -> Result<MatrixDataset, DatasetAccessError> {
        let loader = MatrixDataLoader::new(location)?;
        loader.pre_load_validation(&self.allowed)?;
        let matrix_type = loader
            .matrix_type()
            .ok_or_else(|| DatasetAccessError::UnsupportedMatrixType {
                location: location.to_string(),
            })?;
        let descriptor: Bytes = match loader.schema_location(matrix_type) {
            DataLocation::Local(path) => match tokio::fs::read(&path).await {
                Ok(descriptor) => descriptor.into(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(DatasetAccessError::NotFound {
                        location: path.display().to_string(),
                    })
                }
                Err(err) => return Err(err.into()),
            },
            DataLocation::S3 { bucket, key } => {
                let region = self.region.as_deref().unwrap_or(DEFAULT_REGION);
                let client = self.s3_clients.get(region, S3Credentials::from_env()).await;
                client.download_object(&bucket, &key).await?
            }
        };
        let schema: Value = serde_json::from_slice(&descriptor)?;
        Ok(MatrixDataset {
            location: location.to_string(),
            name: loader.display_name().to_string(),
            matrix_type,
            schema,
        })
    }
}
