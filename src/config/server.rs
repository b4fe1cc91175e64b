//! Server configuration and its validation passes.

use crate::compute::DiffexpComputeConfig;
use crate::config::ConfigContext;
use crate::error::{ConfigurationError, DatasetAccessError};
use crate::matrix_loader::{MatrixDataLoader, MatrixDataType};
use crate::port::{find_available_port, is_port_available, DEFAULT_SERVER_PORT};

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use strum_macros::Display;
use url::Url;
use validator::Validate;

/// Environment variable overriding the first port tried by port discovery.
pub const SERVER_PORT_ENV: &str = "CXG_SERVER_PORT";

/// Datasets larger than this are reported as slow to load.
pub const BIG_FILE_SIZE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Adaptor context key holding the object store region.
pub const ADAPTOR_REGION_KEY: &str = "vfs.s3.region";

/// Server-wide configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub app: AppSettings,
    pub single_dataset: SingleDatasetSettings,
    pub multi_dataset: MultiDatasetSettings,
    pub diffexp: DiffexpSettings,
    pub data_locator: DataLocatorSettings,
    pub adaptor: AdaptorSettings,
    pub limits: Limits,
    /// Resolved dataroots, populated by [ServerConfig::complete_config].
    #[serde(skip)]
    dataroots: Vec<Dataroot>,
    /// Worker pool configuration, populated by [ServerConfig::complete_config].
    #[serde(skip)]
    diffexp_compute: Option<DiffexpComputeConfig>,
}

/// Networking, security and presentation settings of the server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AppSettings {
    pub verbose: bool,
    pub debug: bool,
    pub host: String,
    /// Port to listen on. Unset or zero selects an available port.
    pub port: Option<u16>,
    pub open_browser: bool,
    pub force_https: bool,
    pub secret_key: Option<SessionSecret>,
    pub generate_cache_control_headers: bool,
    /// Accepted for compatibility with existing configuration files; has no effect.
    pub server_timing_headers: bool,
    pub csp_directives: Option<BTreeMap<String, CspDirective>>,
    pub api_base_url: Option<String>,
    pub web_base_url: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            debug: false,
            host: "localhost".to_string(),
            port: None,
            open_browser: false,
            force_https: false,
            secret_key: None,
            generate_cache_control_headers: false,
            server_timing_headers: false,
            csp_directives: None,
            api_base_url: None,
            web_base_url: None,
        }
    }
}

/// Secret used to sign session state.
///
/// The value is redacted from debug output.
#[derive(Clone, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

/// Value of a Content Security Policy directive.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "Value")]
pub enum CspDirective {
    Single(String),
    Multiple(Vec<String>),
}

impl TryFrom<Value> for CspDirective {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        const MESSAGE: &str = "CSP directive value must be a string or list of strings";
        match value {
            Value::String(source) => Ok(Self::Single(source)),
            Value::Array(sources) => sources
                .into_iter()
                .map(|source| match source {
                    Value::String(source) => Ok(source),
                    _ => Err(MESSAGE.to_string()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Multiple),
            _ => Err(MESSAGE.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SingleDatasetSettings {
    /// Location of the single dataset to serve.
    pub datapath: Option<String>,
    pub obs_names: Option<String>,
    pub var_names: Option<String>,
    /// URL describing the dataset.
    pub about: Option<String>,
    /// Display name, defaults to the dataset file name.
    pub title: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MultiDatasetSettings {
    pub dataroot: Option<DatarootSetting>,
    /// Matrix types that may be served. Empty allows every type.
    pub allowed_matrix_types: Vec<String>,
    /// Landing page setting of older web clients. Parsed but not served.
    pub index: Option<IndexSetting>,
}

/// `multi_dataset.index`: a flag or the path of a page.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IndexSetting {
    Enabled(bool),
    Page(String),
}

impl MultiDatasetSettings {
    /// Parse the allowed matrix types.
    pub fn allowed_matrix_types(&self) -> Result<Vec<MatrixDataType>, ConfigurationError> {
        self.allowed_matrix_types
            .iter()
            .map(|name| {
                name.parse::<MatrixDataType>().map_err(|_| {
                    ConfigurationError::new(format!(
                        "Invalid matrix type in allowed_matrix_types: {}",
                        name
                    ))
                })
            })
            .collect()
    }
}

/// Dataroot option: a single root directory or a mapping of tagged roots.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DatarootSetting {
    Path(String),
    Tagged(BTreeMap<String, DatarootEntry>),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatarootEntry {
    pub base_url: Option<String>,
    pub dataroot: Option<String>,
    /// Dataset configuration overrides for datasets under this root.
    pub dataset_config: Option<Value>,
}

/// A validated dataroot.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataroot {
    pub tag: String,
    /// URL path prefix, without leading or trailing slash.
    pub base_url: String,
    /// Directory or `s3://` prefix holding the datasets.
    pub dataroot: String,
    pub dataset_config: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct DiffexpSettings {
    #[validate]
    pub alg_cxg: DiffexpAlgorithmSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct DiffexpAlgorithmSettings {
    #[validate(range(min = 1, message = "max_workers must be greater than 0"))]
    pub max_workers: usize,
    #[validate(range(min = 1, message = "cpu_multiplier must be greater than 0"))]
    pub cpu_multiplier: usize,
    #[validate(range(min = 1, message = "target_workunit must be greater than 0"))]
    pub target_workunit: usize,
}

impl Default for DiffexpAlgorithmSettings {
    fn default() -> Self {
        Self {
            max_workers: 64,
            cpu_multiplier: 4,
            target_workunit: 16_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DataLocatorSettings {
    /// Base URL of the data portal API.
    pub api_base: Option<String>,
    pub s3: S3LocatorSettings,
    /// Lifetime of cached dataset metadata in seconds. Unset keeps entries until evicted.
    pub metadata_cache_max_age: Option<u64>,
    /// Timeout of data portal requests in seconds.
    pub timeout_secs: u64,
}

impl Default for DataLocatorSettings {
    fn default() -> Self {
        Self {
            api_base: None,
            s3: S3LocatorSettings::default(),
            metadata_cache_max_age: None,
            timeout_secs: 30,
        }
    }
}

impl DataLocatorSettings {
    pub fn metadata_cache_max_age(&self) -> Option<Duration> {
        self.metadata_cache_max_age.map(Duration::from_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct S3LocatorSettings {
    pub region_name: Option<RegionSetting>,
}

impl S3LocatorSettings {
    /// Explicit or discovered region.
    pub fn region(&self) -> Option<&str> {
        match &self.region_name {
            Some(RegionSetting::Name(region)) => Some(region),
            _ => None,
        }
    }
}

/// Region option: `true` requests discovery, `false` disables it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RegionSetting {
    Discover(bool),
    Name(String),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AdaptorSettings {
    pub cxg_adaptor: CxgAdaptorSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CxgAdaptorSettings {
    pub tiledb_ctx: BTreeMap<String, Value>,
}

impl Default for CxgAdaptorSettings {
    fn default() -> Self {
        Self {
            tiledb_ctx: BTreeMap::from([
                ("sm.tile_cache_size".to_string(), Value::from(8_589_934_592_u64)),
                ("sm.num_reader_threads".to_string(), Value::from(32)),
            ]),
        }
    }
}

/// Request size limits.
#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    #[validate(range(min = 1, message = "diffexp_cellcount_max must be greater than 0"))]
    pub diffexp_cellcount_max: Option<u64>,
    #[validate(range(min = 1, message = "column_request_max must be greater than 0"))]
    pub column_request_max: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            diffexp_cellcount_max: None,
            column_request_max: Some(32),
        }
    }
}

/// Names of the request size limits.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Limit {
    DiffexpCellcountMax,
    ColumnRequestMax,
}

impl FromStr for Limit {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diffexp_cellcount_max" => Ok(Self::DiffexpCellcountMax),
            "column_request_max" => Ok(Self::ColumnRequestMax),
            _ => Err(ConfigurationError::new(format!("unknown limit {}", s))),
        }
    }
}

impl ServerConfig {
    /// Deserialise a merged configuration tree.
    pub(crate) fn from_tree(tree: &Value) -> Result<Self, ConfigurationError> {
        serde_json::from_value(tree.clone()).map_err(|err| {
            ConfigurationError::new(format!("Invalid server configuration: {}", err))
        })
    }

    /// Validate the configuration and resolve derived values.
    #[tracing::instrument(level = "DEBUG", skip_all)]
    pub async fn complete_config(&mut self, context: &mut ConfigContext) -> Result<(), ConfigurationError> {
        self.handle_app(context)?;
        self.handle_data_source()?;
        self.handle_data_locator(context).await?;
        self.handle_adaptor();
        self.handle_single_dataset(context)?;
        self.handle_multi_dataset()?;
        self.handle_diffexp(context)?;
        self.handle_limits()?;
        Ok(())
    }

    fn handle_app(&mut self, context: &mut ConfigContext) -> Result<(), ConfigurationError> {
        match self.app.port {
            Some(port) if port != 0 => {
                if !is_port_available(&self.app.host, port) {
                    return Err(ConfigurationError::new(format!(
                        "The port selected {} is in use, please configure an open port.",
                        port
                    )));
                }
            }
            _ => {
                let start = match context.var(SERVER_PORT_ENV) {
                    Some(value) => value.parse::<u16>().map_err(|_| {
                        ConfigurationError::new(format!(
                            "Invalid port in {}: {}",
                            SERVER_PORT_ENV, value
                        ))
                    })?,
                    None => DEFAULT_SERVER_PORT,
                };
                let port = find_available_port(&self.app.host, start).ok_or_else(|| {
                    ConfigurationError::new(format!(
                        "Unable to find an available port starting from {}",
                        start
                    ))
                })?;
                self.app.port = Some(port);
            }
        }

        if self.app.debug {
            context.message("in debug mode, setting verbose=true and open_browser=false");
            self.app.verbose = true;
            self.app.open_browser = false;
        }

        if self.app.secret_key.is_none() {
            return Err(ConfigurationError::new(
                "Invalid configuration: app.secret_key must be set, e.g. via CXG_SECRET_KEY",
            ));
        }

        if self.app.web_base_url.is_none() {
            self.app.web_base_url = self.app.api_base_url.clone();
        }
        Ok(())
    }

    fn handle_data_source(&self) -> Result<(), ConfigurationError> {
        match (&self.single_dataset.datapath, &self.multi_dataset.dataroot) {
            (Some(_), Some(_)) => Err(ConfigurationError::new(
                "You must supply a datapath or a dataroot, but not both",
            )),
            (None, None) => Err(ConfigurationError::new(
                "You must supply a datapath or a dataroot",
            )),
            _ => Ok(()),
        }
    }

    async fn handle_data_locator(&mut self, context: &ConfigContext) -> Result<(), ConfigurationError> {
        if self.data_locator.s3.region_name != Some(RegionSetting::Discover(true)) {
            return Ok(());
        }
        let region = match self.region_probe_root() {
            Some(root) => {
                let region = context.region_discovery().discover_region(&root).await;
                match region {
                    Some(region) => Some(region),
                    None => {
                        return Err(ConfigurationError::new(format!(
                            "Unable to discover s3 region name from {}",
                            root
                        )))
                    }
                }
            }
            None => None,
        };
        self.data_locator.s3.region_name = region.map(RegionSetting::Name);
        Ok(())
    }

    /// Object store root probed by region discovery.
    ///
    /// Only one root is probed, so every `s3://` dataroot is assumed to share its region.
    fn region_probe_root(&self) -> Option<String> {
        let is_s3 = |location: &&str| location.starts_with("s3://");
        if let Some(datapath) = self.single_dataset.datapath.as_deref().filter(is_s3) {
            return Some(datapath.to_string());
        }
        match &self.multi_dataset.dataroot {
            Some(DatarootSetting::Path(dataroot)) => {
                Some(dataroot.as_str()).filter(is_s3).map(str::to_string)
            }
            Some(DatarootSetting::Tagged(entries)) => entries
                .values()
                .filter_map(|entry| entry.dataroot.as_deref())
                .find(is_s3)
                .map(str::to_string),
            None => None,
        }
    }

    fn handle_adaptor(&mut self) {
        if let Some(region) = self.data_locator.s3.region().map(str::to_string) {
            self.adaptor
                .cxg_adaptor
                .tiledb_ctx
                .entry(ADAPTOR_REGION_KEY.to_string())
                .or_insert(Value::String(region));
        }
    }

    fn handle_single_dataset(&mut self, context: &mut ConfigContext) -> Result<(), ConfigurationError> {
        let Some(datapath) = self.single_dataset.datapath.as_deref() else {
            return Ok(());
        };
        let loader = MatrixDataLoader::new(datapath)
            .map_err(|err| ConfigurationError::new(err.to_string()))?;
        loader
            .pre_load_validation(&self.multi_dataset.allowed_matrix_types()?)
            .map_err(|err| ConfigurationError::new(err.to_string()))?;
        let file_size = loader
            .file_size()
            .map_err(|err| ConfigurationError::new(err.to_string()))?;
        if file_size > BIG_FILE_SIZE_THRESHOLD {
            context.message(format!(
                "Loading data from {}, this may take a while...",
                loader.basename()
            ));
        } else {
            context.message(format!("Loading data from {}.", loader.basename()));
        }

        if let Some(about) = &self.single_dataset.about {
            let valid = Url::parse(about)
                .map(|url| url.has_host())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigurationError::new(
                    "Must provide an absolute URL for --about. (Example format: http://example.com)",
                ));
            }
        }
        Ok(())
    }

    fn handle_multi_dataset(&mut self) -> Result<(), ConfigurationError> {
        let entries = match self.multi_dataset.dataroot.take() {
            None => return Ok(()),
            Some(DatarootSetting::Path(dataroot)) => BTreeMap::from([(
                "d".to_string(),
                DatarootEntry {
                    base_url: Some("d".to_string()),
                    dataroot: Some(dataroot),
                    dataset_config: None,
                },
            )]),
            Some(DatarootSetting::Tagged(entries)) => entries,
        };

        let mut dataroots: Vec<Dataroot> = Vec::with_capacity(entries.len());
        for (tag, entry) in &entries {
            let (Some(base_url), Some(dataroot)) = (&entry.base_url, &entry.dataroot) else {
                return Err(ConfigurationError::new(format!(
                    "error in multi_dataset.dataroot: missing base_url or dataroot for tag {}",
                    tag
                )));
            };
            check_base_url(base_url).map_err(|reason| {
                ConfigurationError::new(format!(
                    "error in multi_dataset.dataroot: {} for tag {}: {}",
                    reason, tag, base_url
                ))
            })?;
            if dataroots.iter().any(|other| other.base_url == *base_url) {
                return Err(ConfigurationError::new(
                    "error in multi_dataset.dataroot: base_url must be unique",
                ));
            }
            dataroots.push(Dataroot {
                tag: tag.clone(),
                base_url: base_url.clone(),
                dataroot: dataroot.clone(),
                dataset_config: entry.dataset_config.clone(),
            });
        }

        self.multi_dataset.allowed_matrix_types()?;
        self.multi_dataset.dataroot = Some(DatarootSetting::Tagged(entries));
        self.dataroots = dataroots;
        Ok(())
    }

    fn handle_diffexp(&mut self, context: &ConfigContext) -> Result<(), ConfigurationError> {
        self.diffexp.validate()?;
        let alg = &self.diffexp.alg_cxg;
        let max_workers = alg
            .max_workers
            .min(alg.cpu_multiplier.saturating_mul(context.cpu_count()));
        self.diffexp_compute = Some(DiffexpComputeConfig {
            max_workers,
            target_workunit: alg.target_workunit,
        });
        Ok(())
    }

    fn handle_limits(&self) -> Result<(), ConfigurationError> {
        self.limits.validate()?;
        Ok(())
    }

    /// Validated dataroots, in tag order. Empty in single dataset mode.
    pub fn dataroots(&self) -> &[Dataroot] {
        &self.dataroots
    }

    /// Find a dataroot by tag.
    pub fn dataroot(&self, tag: &str) -> Option<&Dataroot> {
        self.dataroots.iter().find(|dataroot| dataroot.tag == tag)
    }

    /// Worker pool configuration resolved by [ServerConfig::complete_config].
    pub fn diffexp_compute(&self) -> Option<DiffexpComputeConfig> {
        self.diffexp_compute
    }

    /// Storage adaptor context.
    pub fn adaptor_context(&self) -> &BTreeMap<String, Value> {
        &self.adaptor.cxg_adaptor.tiledb_ctx
    }

    /// Object store region from the adaptor context.
    pub fn adaptor_region(&self) -> Option<&str> {
        self.adaptor_context()
            .get(ADAPTOR_REGION_KEY)
            .and_then(Value::as_str)
    }

    /// Whether a value exceeds a configured limit. Unset limits are never exceeded.
    pub fn exceeds_limit(&self, limit: Limit, value: u64) -> bool {
        self.limit(limit).map_or(false, |max| value > max)
    }

    /// Fail when a value exceeds a configured limit.
    pub fn check_limit(&self, limit: Limit, value: u64) -> Result<(), DatasetAccessError> {
        match self.limit(limit) {
            Some(max) if value > max => Err(DatasetAccessError::LimitExceeded { limit, value, max }),
            _ => Ok(()),
        }
    }

    fn limit(&self, limit: Limit) -> Option<u64> {
        match limit {
            Limit::DiffexpCellcountMax => self.limits.diffexp_cellcount_max,
            Limit::ColumnRequestMax => self.limits.column_request_max,
        }
    }

    /// Base URL of the API, with `local` resolved to the bind address.
    pub fn get_api_base_url(&self) -> Option<String> {
        self.resolve_base_url(self.app.api_base_url.as_deref())
    }

    /// Base URL of the web client, falling back to the API base URL.
    pub fn get_web_base_url(&self) -> Option<String> {
        match self.app.web_base_url.as_deref() {
            Some(web_base_url) => self.resolve_base_url(Some(web_base_url)),
            None => self.get_api_base_url(),
        }
    }

    fn resolve_base_url(&self, base_url: Option<&str>) -> Option<String> {
        match base_url? {
            "local" => Some(format!(
                "http://{}:{}",
                self.app.host,
                self.app.port.unwrap_or(DEFAULT_SERVER_PORT)
            )),
            base_url => Some(base_url.trim_end_matches('/').to_string()),
        }
    }
}

/// Check that a base URL is a normalised, URL-safe relative path.
fn check_base_url(base_url: &str) -> Result<(), &'static str> {
    let segments: Vec<&str> = base_url.split('/').collect();
    if segments.iter().any(|segment| *segment == "..") {
        return Err("base_url may not contain '..'");
    }
    if segments.iter().any(|segment| segment.is_empty() || *segment == ".") {
        return Err("base_url must be a normalized relative path");
    }
    let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~' | '-');
    if !segments.iter().all(|segment| segment.chars().all(safe)) {
        return Err("base_url must not require URL encoding");
    }
    Ok(())
}
