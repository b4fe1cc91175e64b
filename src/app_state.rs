use crate::compute::DiffexpComputeConfig;
use crate::config::AppConfig;
use crate::data_portal::{DataPortal, DataPortalClient};
use crate::error::ConfigurationError;
use crate::matrix_loader::MatrixStore;
use crate::metadata_cache::MetadataCache;
use crate::resolver::DatasetResolver;

use std::sync::Arc;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Completed application configuration.
    pub config: AppConfig,

    /// Dataset location resolver.
    pub resolver: DatasetResolver,

    /// Dataset loader.
    pub matrix_store: MatrixStore,

    /// Differential expression compute sizing.
    pub diffexp_compute: DiffexpComputeConfig,
}

impl AppState {
    /// Create and return an [AppState], connecting to the data portal if one is configured.
    pub fn new(config: AppConfig) -> Result<Self, ConfigurationError> {
        let data_locator = &config.server_config.data_locator;
        let portal = match &data_locator.api_base {
            Some(api_base) => {
                let client = DataPortalClient::new(api_base, data_locator.timeout()).map_err(|err| {
                    ConfigurationError::new(format!("Invalid data portal {}: {}", api_base, err))
                })?;
                Some(Arc::new(client) as Arc<dyn DataPortal>)
            }
            None => None,
        };
        Self::with_portal(config, portal)
    }

    /// Create and return an [AppState] using the given data portal.
    pub fn with_portal(config: AppConfig, portal: Option<Arc<dyn DataPortal>>) -> Result<Self, ConfigurationError> {
        if !config.is_completed() {
            return Err(ConfigurationError::new(
                "configuration must be completed before serving",
            ));
        }
        let server_config = &config.server_config;
        let cache = MetadataCache::new(server_config.data_locator.metadata_cache_max_age());
        let resolver = DatasetResolver::new(server_config, portal, cache);
        let matrix_store = MatrixStore::new(
            server_config.adaptor_region().map(str::to_string),
            server_config.multi_dataset.allowed_matrix_types()?,
        );
        let diffexp_compute = server_config
            .diffexp_compute()
            .ok_or_else(|| ConfigurationError::new("diffexp compute is not configured"))?;
        tracing::info!(
            "diffexp configured with {} workers",
            diffexp_compute.max_workers
        );

        Ok(Self {
            config,
            resolver,
            matrix_store,
            diffexp_compute,
        })
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
