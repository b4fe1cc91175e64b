use crate::config::{AppConfig, ConfigContext};
use crate::data_portal::{Collection, CollectionVisibility, DataPortal, DatasetMetadata, PortalError};
use crate::metadata_cache::Clock;
use crate::s3_client::RegionDiscovery;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Create a ConfigContext with an empty environment, four CPUs and no object store region.
pub(crate) fn test_context() -> ConfigContext {
    ConfigContext::new(Arc::new(FakeRegionDiscovery::new(None)))
        .with_env(HashMap::new())
        .with_cpu_count(4)
}

/// Create a completed AppConfig from server configuration fields.
///
/// A secret key and a loopback host are set before `fields` are applied.
pub(crate) async fn completed_config(fields: Value) -> AppConfig {
    let mut config = AppConfig::new();
    config
        .update_server_config(json!({"app": {"host": "127.0.0.1", "secret_key": "secret"}}))
        .unwrap();
    config.update_server_config(fields).unwrap();
    config.complete_config(&mut test_context()).await.unwrap();
    config
}

/// Region discovery returning a fixed region and recording the probed URIs.
pub(crate) struct FakeRegionDiscovery {
    region: Option<String>,
    probed: Mutex<Vec<String>>,
}

impl FakeRegionDiscovery {
    pub(crate) fn new(region: Option<&str>) -> Self {
        Self {
            region: region.map(str::to_string),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegionDiscovery for FakeRegionDiscovery {
    async fn discover_region(&self, uri: &str) -> Option<String> {
        self.probed.lock().unwrap().push(uri.to_string());
        self.region.clone()
    }
}

/// A clock that only moves when told to.
pub(crate) struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap()
    }
}

/// A dataset with a schema descriptor in a temporary dataroot.
pub(crate) struct DatasetFixture {
    dir: TempDir,
    path: PathBuf,
    schema: Value,
}

impl DatasetFixture {
    /// Create a cxg dataset directory containing `schema.json`.
    pub(crate) fn cxg(name: &str, schema: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("schema.json"), schema.to_string()).unwrap();
        Self { dir, path, schema }
    }

    /// Create an h5ad dataset file with a `.schema.json` sidecar.
    pub(crate) fn h5ad(name: &str, schema: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n").unwrap();
        std::fs::write(
            dir.path().join(format!("{}.schema.json", name)),
            schema.to_string(),
        )
        .unwrap();
        Self { dir, path, schema }
    }

    /// Directory containing the dataset.
    pub(crate) fn dataroot(&self) -> String {
        self.dir.path().display().to_string()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the dataset as served.
    pub(crate) fn location(&self) -> String {
        self.path.display().to_string()
    }

    pub(crate) fn schema(&self) -> Value {
        self.schema.clone()
    }
}

/// Create a cxg dataset with a small schema.
pub(crate) fn cxg_fixture(name: &str) -> DatasetFixture {
    DatasetFixture::cxg(
        name,
        json!({
            "dataframe": {"nObs": 2638, "nVar": 1838, "type": "float32"},
            "annotations": {"obs": {"index": "obs_names"}, "var": {"index": "var_names"}},
            "layout": {"obs": [{"name": "umap", "type": "float32", "dims": ["umap_0", "umap_1"]}]},
        }),
    )
}

/// Create a portal record with no location that is not tombstoned.
pub(crate) fn portal_record(visibility: CollectionVisibility) -> DatasetMetadata {
    DatasetMetadata {
        collection_id: "c1".to_string(),
        collection_visibility: visibility,
        dataset_id: "d1".to_string(),
        s3_uri: None,
        tombstoned: false,
    }
}

/// Canned answer of a [FakePortal] to dataset metadata queries.
pub(crate) enum PortalResponse {
    Found(DatasetMetadata),
    NotFound,
    Error,
}

/// Data portal returning canned answers and recording the dataset URLs it is asked about.
pub(crate) struct FakePortal {
    response: PortalResponse,
    collection: Option<Collection>,
    calls: AtomicUsize,
    requested_urls: Mutex<Vec<String>>,
}

impl FakePortal {
    pub(crate) fn new(response: PortalResponse) -> Self {
        Self {
            response,
            collection: None,
            calls: AtomicUsize::new(0),
            requested_urls: Mutex::new(Vec::new()),
        }
    }

    /// Answer collection queries with `collection`. Without one, they fail with a 404.
    pub(crate) fn with_collection(mut self, collection: Collection) -> Self {
        self.collection = Some(collection);
        self
    }

    /// Number of dataset metadata queries.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requested_urls(&self) -> Vec<String> {
        self.requested_urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataPortal for FakePortal {
    async fn dataset_metadata(&self, dataset_url: &str) -> Result<Option<DatasetMetadata>, PortalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested_urls
            .lock()
            .unwrap()
            .push(dataset_url.to_string());
        match &self.response {
            PortalResponse::Found(metadata) => Ok(Some(metadata.clone())),
            PortalResponse::NotFound => Ok(None),
            PortalResponse::Error => Err(PortalError::Status(500)),
        }
    }

    async fn collection(
        &self,
        _collection_id: &str,
        _visibility: CollectionVisibility,
    ) -> Result<Collection, PortalError> {
        self.collection.clone().ok_or(PortalError::Status(404))
    }
}
