//! A simplified S3 client that supports downloading objects and locating buckets.
//! It attempts to hide the complexities of working with the AWS SDK for S3.

use crate::error::DatasetAccessError;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use axum::body::Bytes;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::Instrument;

/// Region used when none is configured, and for bucket location requests.
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone, Eq, Hash, PartialEq)]
pub enum S3Credentials {
    AccessKey {
        access_key: String,
        secret_key: String,
    },
    None,
}

impl S3Credentials {
    /// Create an access key credential.
    pub fn access_key(access_key: &str, secret_key: &str) -> Self {
        S3Credentials::AccessKey {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    /// Read an access key credential from the standard AWS environment variables.
    pub fn from_env() -> Self {
        match (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Ok(access_key), Ok(secret_key)) => Self::access_key(&access_key, &secret_key),
            _ => Self::None,
        }
    }
}

/// Split an `s3://bucket/key` URI into its bucket and key.
///
/// The key may be empty. Returns `None` for other URIs or an empty bucket.
pub fn parse_s3_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        None
    } else {
        Some((bucket, key))
    }
}

/// A map containing initialised S3Client objects.
///
/// The [aws_sdk_s3::Client] object is relatively expensive to create, so we reuse them where
/// possible. This type provides a map for storing the clients objects.
///
/// The map's key is a 2-tuple of the region and credentials.
/// The value is the corresponding client object.
pub struct S3ClientMap {
    /// A [hashbrown::HashMap] for storing the S3 clients. A read-write lock synchronises access to
    /// the map, optimised for reads.
    map: RwLock<HashMap<(String, S3Credentials), S3Client>>,
}

impl S3ClientMap {
    /// Create and return an [crate::s3_client::S3ClientMap].
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        S3ClientMap {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create an [crate::s3_client::S3Client] object from the map.
    ///
    /// # Arguments
    ///
    /// * `region`: Object storage region
    /// * `credentials`: Object storage account credentials
    pub async fn get(&self, region: &str, credentials: S3Credentials) -> S3Client {
        let key = (region.to_string(), credentials.clone());
        // Common case: return an existing client from the map.
        {
            let map = self.map.read().await;
            if let Some(client) = map.get(&key) {
                return client.clone();
            }
        }
        // Less common case: create a new client, insert it into the map and return it.
        let mut map = self.map.write().await;
        // Allow for a possible race here since we dropped the read lock.
        if let Some(client) = map.get(&key) {
            client.clone()
        } else {
            tracing::info!("Creating new S3 client for region {}", region);
            let client = S3Client::new(region, credentials);
            let (_, client) = map.insert_unique_unchecked(key, client);
            client.clone()
        }
    }
}

/// S3 client object.
#[derive(Clone)]
pub struct S3Client {
    /// Underlying AWS SDK S3 client object.
    client: Client,
}

impl S3Client {
    /// Creates an S3Client object
    ///
    /// # Arguments
    ///
    /// * `region`: Object storage region
    /// * `credentials`: Object storage account credentials
    pub fn new(region: &str, credentials: S3Credentials) -> Self {
        let builder = aws_sdk_s3::Config::builder().behavior_version(BehaviorVersion::latest());
        let builder = match credentials {
            S3Credentials::AccessKey {
                access_key,
                secret_key,
            } => {
                let credentials = Credentials::from_keys(access_key, secret_key, None);
                builder.credentials_provider(credentials)
            }
            S3Credentials::None => builder,
        };
        let s3_config = builder.region(Some(Region::new(region.to_string()))).build();
        let client = Client::from_conf(s3_config);
        Self { client }
    }

    /// Downloads an object from object storage and returns the data as Bytes
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    pub async fn download_object(&self, bucket: &str, key: &str) -> Result<Bytes, DatasetAccessError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .instrument(tracing::Span::current())
            .await?;
        let data = response
            .body
            .collect()
            .instrument(tracing::Span::current())
            .await?;
        Ok(data.into_bytes())
    }

    /// Returns the region of a bucket, or `None` if it cannot be determined.
    pub async fn bucket_region(&self, bucket: &str) -> Option<String> {
        let result = self
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .instrument(tracing::Span::current())
            .await;
        match result {
            Ok(output) => Some(location_constraint_region(
                output.location_constraint().map(|constraint| constraint.as_str()),
            )),
            Err(err) => {
                tracing::warn!("Unable to locate bucket {}: {}", bucket, err);
                None
            }
        }
    }
}

/// Map a bucket location constraint onto its region.
///
/// Buckets in the default region have no location constraint, and some legacy buckets report
/// `EU`.
fn location_constraint_region(constraint: Option<&str>) -> String {
    match constraint {
        None | Some("") => DEFAULT_REGION.to_string(),
        Some("EU") => "eu-west-1".to_string(),
        Some(region) => region.to_string(),
    }
}

/// Discovery of the object store region holding a dataset root.
#[async_trait]
pub trait RegionDiscovery: Send + Sync {
    /// Return the region of the bucket named by an `s3://` URI, or `None` on failure.
    async fn discover_region(&self, uri: &str) -> Option<String>;
}

/// Region discovery using S3 bucket location requests.
pub struct S3RegionDiscovery {
    credentials: S3Credentials,
}

impl S3RegionDiscovery {
    pub fn new(credentials: S3Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl RegionDiscovery for S3RegionDiscovery {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn discover_region(&self, uri: &str) -> Option<String> {
        let (bucket, _) = parse_s3_uri(uri)?;
        S3Client::new(DEFAULT_REGION, self.credentials.clone())
            .bucket_region(bucket)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_access_key() -> S3Credentials {
        S3Credentials::access_key("user", "password")
    }

    fn make_alt_access_key() -> S3Credentials {
        S3Credentials::access_key("user2", "password")
    }

    #[tokio::test]
    async fn s3_client_map() {
        let map = S3ClientMap::new();
        map.get("us-east-1", make_access_key()).await;
        map.get("us-east-1", make_access_key()).await;
        assert_eq!(map.map.read().await.len(), 1);
        map.get("us-east-1", make_alt_access_key()).await;
        assert_eq!(map.map.read().await.len(), 2);
        map.get("us-east-1", S3Credentials::None).await;
        map.get("us-east-1", S3Credentials::None).await;
        assert_eq!(map.map.read().await.len(), 3);
        map.get("eu-west-2", S3Credentials::None).await;
        assert_eq!(map.map.read().await.len(), 4);
    }

    #[test]
    fn new() {
        S3Client::new("us-east-1", make_access_key());
    }

    #[test]
    fn new_no_auth() {
        S3Client::new("us-east-1", S3Credentials::None);
    }

    #[test]
    fn parse_s3_uri_bucket_and_key() {
        assert_eq!(
            Some(("cellxgene", "datasets/pbmc3k.cxg")),
            parse_s3_uri("s3://cellxgene/datasets/pbmc3k.cxg")
        );
    }

    #[test]
    fn parse_s3_uri_bucket_only() {
        assert_eq!(Some(("example-bucket", "")), parse_s3_uri("s3://example-bucket"));
        assert_eq!(Some(("example-bucket", "")), parse_s3_uri("s3://example-bucket/"));
    }

    #[test]
    fn parse_s3_uri_invalid() {
        assert_eq!(None, parse_s3_uri("s3://"));
        assert_eq!(None, parse_s3_uri("/data/pbmc3k.cxg"));
        assert_eq!(None, parse_s3_uri("https://example.com/bucket"));
    }

    #[test]
    fn location_constraints() {
        assert_eq!("us-east-1", location_constraint_region(None));
        assert_eq!("us-east-1", location_constraint_region(Some("")));
        assert_eq!("eu-west-1", location_constraint_region(Some("EU")));
        assert_eq!("us-west-2", location_constraint_region(Some("us-west-2")));
    }

    #[tokio::test]
    async fn discover_region_not_s3() {
        let discovery = S3RegionDiscovery::new(S3Credentials::None);
        assert_eq!(None, discovery.discover_region("/data/pbmc3k.cxg").await);
    }
}
