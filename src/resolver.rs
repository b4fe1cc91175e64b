//! Dataset location resolution.
//!
//! Maps a requested dataset onto the storage location to load it from. In multi-dataset mode the
//! data portal is consulted first, if configured, and its answers are cached. When the portal
//! cannot help the dataset is looked for under its dataroot.

use crate::config::server::{Dataroot, ServerConfig};
use crate::data_portal::{DataPortal, DatasetMetadata};
use crate::error::DatasetAccessError;
use crate::metadata_cache::{CacheEntry, DatasetKey, MetadataCache};
use crate::metrics;

use std::path::Path;
use std::sync::Arc;

/// Where a resolved location came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LocationSource {
    Cache,
    Portal,
    /// The dataroot or single dataset path.
    Static,
}

/// A dataset whose location is known.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedDataset {
    pub key: DatasetKey,
    pub location: String,
    /// Portal record of the dataset, when the portal knows it.
    pub metadata: Option<DatasetMetadata>,
    pub source: LocationSource,
}

/// Outcome of resolving a dataset.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Located(ResolvedDataset),
    /// The dataset was withdrawn; clients are sent to its collection.
    Redirect(String),
}

pub struct DatasetResolver {
    cache: MetadataCache,
    portal: Option<Arc<dyn DataPortal>>,
    web_base_url: Option<String>,
    dataroots: Vec<Dataroot>,
    datapath: Option<String>,
}

impl DatasetResolver {
    /// Create a resolver for a completed server configuration.
    pub fn new(config: &ServerConfig, portal: Option<Arc<dyn DataPortal>>, cache: MetadataCache) -> Self {
        Self {
            cache,
            portal,
            web_base_url: config.get_web_base_url(),
            dataroots: config.dataroots().to_vec(),
            datapath: config.single_dataset.datapath.clone(),
        }
    }

    pub fn portal(&self) -> Option<&dyn DataPortal> {
        self.portal.as_deref()
    }

    pub fn web_base_url(&self) -> Option<&str> {
        self.web_base_url.as_deref()
    }

    /// Resolve a dataset to its location.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn resolve(&self, key: &DatasetKey) -> Result<Resolution, DatasetAccessError> {
        check_dataset_name(&key.dataset)?;
        let dataroot = match &key.tag {
            Some(tag) => Some(
                self.dataroots
                    .iter()
                    .find(|dataroot| dataroot.tag == *tag)
                    .ok_or_else(|| DatasetAccessError::NotFound {
                        location: key.to_string(),
                    })?,
            ),
            None => None,
        };

        if let Some(entry) = self.cache.get(key).await {
            metrics::record_cache_lookup(true);
            return Ok(self.cached(key, entry));
        }
        metrics::record_cache_lookup(false);

        let mut metadata = None;
        if let (Some(portal), Some(dataroot), Some(web_base_url)) =
            (&self.portal, dataroot, &self.web_base_url)
        {
            let dataset_url = format!("{}/{}/{}/", web_base_url, dataroot.base_url, key.dataset);
            match portal.dataset_metadata(&dataset_url).await {
                Ok(Some(record)) if record.tombstoned => {
                    metrics::record_portal_lookup("tombstoned");
                    let redirect = record.tombstone_redirect_url(web_base_url);
                    let entry = CacheEntry {
                        metadata: record,
                        location: None,
                    };
                    self.cache.insert(key.clone(), entry).await;
                    return Ok(Resolution::Redirect(redirect));
                }
                Ok(Some(record)) => {
                    let location = record
                        .s3_uri
                        .as_deref()
                        .map(|uri| uri.trim_end_matches('/'))
                        .filter(|uri| !uri.is_empty())
                        .map(str::to_string);
                    match location {
                        Some(location) => {
                            metrics::record_portal_lookup("found");
                            let entry = CacheEntry {
                                metadata: record.clone(),
                                location: Some(location.clone()),
                            };
                            self.cache.insert(key.clone(), entry).await;
                            return Ok(Resolution::Located(ResolvedDataset {
                                key: key.clone(),
                                location,
                                metadata: Some(record),
                                source: LocationSource::Portal,
                            }));
                        }
                        None => {
                            metrics::record_portal_lookup("no_location");
                            tracing::info!("data portal has no location for {}", dataset_url);
                            metadata = Some(record);
                        }
                    }
                }
                Ok(None) => {
                    metrics::record_portal_lookup("not_found");
                    tracing::info!("data portal has no record of {}", dataset_url);
                }
                Err(err) => {
                    metrics::record_portal_lookup("error");
                    tracing::warn!("data portal lookup of {} failed: {}", dataset_url, err);
                }
            }
        }

        Ok(Resolution::Located(ResolvedDataset {
            key: key.clone(),
            location: self.static_location(dataroot, &key.dataset)?,
            metadata,
            source: LocationSource::Static,
        }))
    }

    fn cached(&self, key: &DatasetKey, entry: CacheEntry) -> Resolution {
        match entry.location {
            Some(location) => Resolution::Located(ResolvedDataset {
                key: key.clone(),
                location,
                metadata: Some(entry.metadata),
                source: LocationSource::Cache,
            }),
            None => Resolution::Redirect(
                entry
                    .metadata
                    .tombstone_redirect_url(self.web_base_url.as_deref().unwrap_or_default()),
            ),
        }
    }

    fn static_location(&self, dataroot: Option<&Dataroot>, dataset: &str) -> Result<String, DatasetAccessError> {
        match dataroot {
            Some(dataroot) if dataroot.dataroot.starts_with("s3://") => Ok(format!(
                "{}/{}",
                dataroot.dataroot.trim_end_matches('/'),
                dataset
            )),
            Some(dataroot) => Ok(Path::new(&dataroot.dataroot)
                .join(dataset)
                .to_string_lossy()
                .into_owned()),
            None => self
                .datapath
                .clone()
                .ok_or_else(|| DatasetAccessError::NotFound {
                    location: dataset.to_string(),
                }),
        }
    }

    /// Forget the cached location of a dataset.
    pub async fn evict(&self, key: &DatasetKey) {
        if self.cache.evict(key).await {
            metrics::record_cache_eviction();
            tracing::info!("evicted cached location of {}", key);
        }
    }
}

/// Reject dataset names that would escape their dataroot.
fn check_dataset_name(dataset: &str) -> Result<(), DatasetAccessError> {
    let invalid = dataset.is_empty()
        || dataset == "."
        || dataset == ".."
        || dataset.contains('/')
        || dataset.contains('\\');
    if invalid {
        return Err(DatasetAccessError::InvalidDatasetPath {
            path: dataset.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_portal::CollectionVisibility;
    use crate::test_utils::{completed_config, portal_record, FakePortal, PortalResponse};
    use serde_json::json;

    const WEB_BASE_URL: &str = "https://cellxgene.example.com";

    async fn resolver(portal: Option<Arc<FakePortal>>) -> DatasetResolver {
        let config = completed_config(json!({
            "app": {"web_base_url": WEB_BASE_URL},
            "data_locator": {"api_base": "https://api.example.com/dp/v1"},
            "multi_dataset": {"dataroot": {
                "e": {"base_url": "e", "dataroot": "/data/e"},
                "s3": {"base_url": "d", "dataroot": "s3://cellxgene/sets/"},
            }},
        }))
        .await;
        let portal = portal.map(|portal| portal as Arc<dyn DataPortal>);
        DatasetResolver::new(&config.server_config, portal, MetadataCache::new(None))
    }

    fn located(resolution: Resolution) -> ResolvedDataset {
        match resolution {
            Resolution::Located(resolved) => resolved,
            Resolution::Redirect(url) => panic!("unexpected redirect to {}", url),
        }
    }

    #[tokio::test]
    async fn static_fallback_without_portal() {
        let resolver = resolver(None).await;
        let key = DatasetKey::new(Some("e"), "pbmc3k.cxg");
        let resolved = located(resolver.resolve(&key).await.unwrap());
        assert_eq!("/data/e/pbmc3k.cxg", resolved.location);
        assert_eq!(LocationSource::Static, resolved.source);
        assert_eq!(None, resolved.metadata);
    }

    #[tokio::test]
    async fn static_fallback_s3_dataroot() {
        let resolver = resolver(None).await;
        let key = DatasetKey::new(Some("s3"), "pbmc3k.cxg");
        let resolved = located(resolver.resolve(&key).await.unwrap());
        assert_eq!("s3://cellxgene/sets/pbmc3k.cxg", resolved.location);
    }

    #[tokio::test]
    async fn portal_location_is_cached() {
        let mut record = portal_record(CollectionVisibility::Public);
        record.s3_uri = Some("s3://cellxgene/published/pbmc3k.cxg/".to_string());
        let portal = Arc::new(FakePortal::new(PortalResponse::Found(record)));
        let resolver = resolver(Some(portal.clone())).await;
        let key = DatasetKey::new(Some("e"), "pbmc3k.cxg");

        let resolved = located(resolver.resolve(&key).await.unwrap());
        assert_eq!("s3://cellxgene/published/pbmc3k.cxg", resolved.location);
        assert_eq!(LocationSource::Portal, resolved.source);
        assert_eq!(
            vec![format!("{}/e/pbmc3k.cxg/", WEB_BASE_URL)],
            portal.requested_urls()
        );

        let resolved = located(resolver.resolve(&key).await.unwrap());
        assert_eq!("s3://cellxgene/published/pbmc3k.cxg", resolved.location);
        assert_eq!(LocationSource::Cache, resolved.source);
        assert_eq!(1, portal.calls());
    }

    #[tokio::test]
    async fn evict_forces_portal_lookup() {
        let mut record = portal_record(CollectionVisibility::Public);
        record.s3_uri = Some("s3://cellxgene/published/pbmc3k.cxg".to_string());
        let portal = Arc::new(FakePortal::new(PortalResponse::Found(record)));
        let resolver = resolver(Some(portal.clone())).await;
        let key = DatasetKey::new(Some("e"), "pbmc3k.cxg");

        resolver.resolve(&key).await.unwrap();
        resolver.evict(&key).await;
        let resolved = located(resolver.resolve(&key).await.unwrap());
        assert_eq!(LocationSource::Portal, resolved.source);
        assert_eq!(2, portal.calls());
    }

    #[tokio::test]
    async fn tombstoned_redirect_is_cached() {
        let mut record = portal_record(CollectionVisibility::Private);
        record.tombstoned = true;
        let portal = Arc::new(FakePortal::new(PortalResponse::Found(record.clone())));
        let resolver = resolver(Some(portal.clone())).await;
        let key = DatasetKey::new(Some("e"), "pbmc3k.cxg");
        let expected = Resolution::Redirect(format!(
            "{}/collections/{}/private?tombstoned_dataset_id={}",
            WEB_BASE_URL, record.collection_id, record.dataset_id
        ));

        assert_eq!(expected, resolver.resolve(&key).await.unwrap());
        assert_eq!(expected, resolver.resolve(&key).await.unwrap());
        assert_eq!(1, portal.calls());
    }

    #[tokio::test]
    async fn portal_without_location_falls_back() {
        let record = portal_record(CollectionVisibility::Public);
        let portal = Arc::new(FakePortal::new(PortalResponse::Found(record.clone())));
        let resolver = resolver(Some(portal.clone())).await;
        let key = DatasetKey::new(Some("e"), "pbmc3k.cxg");

        let resolved = located(resolver.resolve(&key).await.unwrap());
        assert_eq!("/data/e/pbmc3k.cxg", resolved.location);
        assert_eq!(LocationSource::Static, resolved.source);
        assert_eq!(Some(record), resolved.metadata);

        resolver.resolve(&key).await.unwrap();
        assert_eq!(2, portal.calls());
    }

    #[tokio::test]
    async fn portal_failures_fall_back_uncached() {
        for response in [PortalResponse::NotFound, PortalResponse::Error] {
            let portal = Arc::new(FakePortal::new(response));
            let resolver = resolver(Some(portal.clone())).await;
            let key = DatasetKey::new(Some("e"), "pbmc3k.cxg");

            let resolved = located(resolver.resolve(&key).await.unwrap());
            assert_eq!("/data/e/pbmc3k.cxg", resolved.location);
            assert_eq!(LocationSource::Static, resolved.source);

            resolver.resolve(&key).await.unwrap();
            assert_eq!(2, portal.calls());
        }
    }

    #[tokio::test]
    async fn single_dataset() {
        let fixture = crate::test_utils::cxg_fixture("pbmc3k.cxg");
        let config = completed_config(json!({
            "single_dataset": {"datapath": fixture.location()},
        }))
        .await;
        let portal = Arc::new(FakePortal::new(PortalResponse::NotFound));
        let resolver = DatasetResolver::new(
            &config.server_config,
            Some(portal.clone() as Arc<dyn DataPortal>),
            MetadataCache::new(None),
        );
        let resolved =
            located(resolver.resolve(&DatasetKey::new(None, "pbmc3k.cxg")).await.unwrap());
        assert_eq!(fixture.location(), resolved.location);
        assert_eq!(0, portal.calls());
    }

    #[tokio::test]
    async fn invalid_dataset_names() {
        let portal = Arc::new(FakePortal::new(PortalResponse::NotFound));
        let resolver = resolver(Some(portal.clone())).await;
        for dataset in ["..", ".", "", "a/b", "/etc", "..\\b"] {
            let key = DatasetKey::new(Some("e"), dataset);
            assert!(
                matches!(
                    resolver.resolve(&key).await,
                    Err(DatasetAccessError::InvalidDatasetPath { .. })
                ),
                "{}",
                dataset
            );
        }
        assert_eq!(0, portal.calls());
    }

    #[tokio::test]
    async fn unknown_tag() {
        let resolver = resolver(None).await;
        let key = DatasetKey::new(Some("x"), "pbmc3k.cxg");
        assert!(matches!(
            resolver.resolve(&key).await,
            Err(DatasetAccessError::NotFound { .. })
        ));
    }
}
