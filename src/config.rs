//! Layered application configuration.
//!
//! An [AppConfig] is assembled from built-in defaults, an optional TOML configuration file,
//! programmatic updates and environment bindings, in increasing order of priority. Each source is
//! merged into a JSON tree which is then deserialised into strongly typed records, so that
//! unknown keys and ill-typed values are rejected as soon as they are applied.
//! [AppConfig::complete_config] runs the semantic validation passes and must succeed before the
//! configuration is served.

pub mod dataset;
pub mod external;
pub mod server;

use crate::cli::CommandLineArgs;
use crate::error::ConfigurationError;
use crate::s3_client::RegionDiscovery;

use dataset::DatasetConfig;
use external::ExternalConfig;
use server::ServerConfig;

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Server configuration mappings that an update replaces wholesale rather than merging.
const SERVER_REPLACED_PATHS: &[&[&str]] = &[
    &["app", "csp_directives"],
    &["adaptor", "cxg_adaptor", "tiledb_ctx"],
    &["multi_dataset", "dataroot"],
];

/// Context for completing a configuration.
///
/// Carries the collaborators and process facts the validation passes depend on, so that they can
/// be substituted in tests.
pub struct ConfigContext {
    /// Status messages reported while completing the configuration.
    messages: Vec<String>,
    /// Snapshot of the process environment.
    env: HashMap<String, String>,
    /// Number of CPUs available to the diffexp worker pool.
    cpu_count: usize,
    /// Object store region discovery.
    region_discovery: Arc<dyn RegionDiscovery>,
}

impl ConfigContext {
    /// Create a context from the process environment and CPU count.
    pub fn new(region_discovery: Arc<dyn RegionDiscovery>) -> Self {
        Self {
            messages: Vec::new(),
            env: std::env::vars().collect(),
            cpu_count: num_cpus::get(),
            region_discovery,
        }
    }

    /// Replace the environment snapshot.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Replace the CPU count.
    pub fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    /// Report a status message to the operator.
    pub fn message(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.messages.push(message);
    }

    /// Messages reported so far.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Look up an environment variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn region_discovery(&self) -> &dyn RegionDiscovery {
        self.region_discovery.as_ref()
    }
}

impl fmt::Debug for ConfigContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigContext")
            .field("messages", &self.messages)
            .field("cpu_count", &self.cpu_count)
            .finish_non_exhaustive()
    }
}

/// Application configuration: server settings, dataset settings and environment bindings.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Server-wide configuration.
    pub server_config: ServerConfig,
    /// Dataset configuration applied to every dataset without dataroot overrides.
    pub default_dataset_config: DatasetConfig,
    /// Environment bindings.
    pub external_config: ExternalConfig,
    server_tree: Value,
    dataset_tree: Value,
    dataroot_dataset_configs: BTreeMap<String, DatasetConfig>,
    is_completed: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfig {
    /// Create a configuration holding the built-in defaults.
    pub fn new() -> Self {
        Self {
            server_config: ServerConfig::default(),
            default_dataset_config: DatasetConfig::default(),
            external_config: ExternalConfig::default(),
            server_tree: Value::Object(Map::new()),
            dataset_tree: Value::Object(Map::new()),
            dataroot_dataset_configs: BTreeMap::new(),
            is_completed: false,
        }
    }

    /// Merge fields into the server configuration.
    ///
    /// `fields` is a nested mapping of server options, e.g. `{"app": {"port": 5005}}`. The update
    /// is rejected, leaving the configuration untouched, if it names an unknown key or holds a
    /// value of the wrong type.
    pub fn update_server_config(&mut self, fields: Value) -> Result<(), ConfigurationError> {
        let tree = merged(&self.server_tree, fields, SERVER_REPLACED_PATHS)?;
        self.server_config = ServerConfig::from_tree(&tree)?;
        self.server_tree = tree;
        self.is_completed = false;
        Ok(())
    }

    /// Merge fields into the default dataset configuration.
    pub fn update_default_dataset_config(&mut self, fields: Value) -> Result<(), ConfigurationError> {
        let tree = merged(&self.dataset_tree, fields, &[])?;
        self.default_dataset_config = DatasetConfig::from_tree(&tree)?;
        self.dataset_tree = tree;
        self.is_completed = false;
        Ok(())
    }

    /// Add environment bindings from an `external` configuration section.
    pub fn update_external_config(&mut self, fields: Value) -> Result<(), ConfigurationError> {
        let external = ExternalConfig::from_tree(fields)?;
        self.external_config.environment.extend(external.environment);
        self.is_completed = false;
        Ok(())
    }

    /// Apply the `server`, `dataset` and `external` sections of a TOML document.
    pub fn update_from_toml(&mut self, contents: &str) -> Result<(), ConfigurationError> {
        let document: toml::Value = toml::from_str(contents).map_err(|err| {
            ConfigurationError::new(format!("Failed to parse configuration: {}", err))
        })?;
        let document = serde_json::to_value(document).map_err(|err| {
            ConfigurationError::new(format!("Failed to parse configuration: {}", err))
        })?;
        let Value::Object(sections) = document else {
            return Err(ConfigurationError::new("configuration must be a table"));
        };
        for (section, fields) in sections {
            match section.as_str() {
                "server" => self.update_server_config(fields)?,
                "dataset" => self.update_default_dataset_config(fields)?,
                "external" => self.update_external_config(fields)?,
                _ => {
                    return Err(ConfigurationError::new(format!(
                        "Unexpected config: unknown section `{}`",
                        section
                    )))
                }
            }
        }
        Ok(())
    }

    /// Apply a TOML configuration file.
    pub fn update_from_config_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigurationError::new(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                err
            ))
        })?;
        self.update_from_toml(&contents)
    }

    /// Apply environment bindings and run every validation pass.
    ///
    /// On success the configuration is complete and may be served.
    pub async fn complete_config(&mut self, context: &mut ConfigContext) -> Result<(), ConfigurationError> {
        let mut tree = self.server_tree.clone();
        self.external_config.handle_environment(context, &mut tree)?;
        let mut server_config = ServerConfig::from_tree(&tree)?;
        server_config.complete_config(context).await?;

        self.default_dataset_config.complete_config()?;
        let mut dataroot_dataset_configs = BTreeMap::new();
        for dataroot in server_config.dataroots() {
            if let Some(overrides) = &dataroot.dataset_config {
                let dataset_tree = merged(&self.dataset_tree, overrides.clone(), &[])?;
                let dataset_config = DatasetConfig::from_tree(&dataset_tree)
                    .and_then(|config| config.complete_config().map(|_| config))
                    .map_err(|err| {
                        ConfigurationError::new(format!(
                            "error in dataset_config for tag {}: {}",
                            dataroot.tag, err
                        ))
                    })?;
                dataroot_dataset_configs.insert(dataroot.tag.clone(), dataset_config);
            }
        }

        self.server_tree = tree;
        self.server_config = server_config;
        self.dataroot_dataset_configs = dataroot_dataset_configs;
        self.is_completed = true;
        Ok(())
    }

    /// Whether [AppConfig::complete_config] has succeeded since the last update.
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Effective dataset configuration for a dataroot tag.
    pub fn dataset_config(&self, tag: Option<&str>) -> &DatasetConfig {
        tag.and_then(|tag| self.dataroot_dataset_configs.get(tag))
            .unwrap_or(&self.default_dataset_config)
    }
}

/// Build an [AppConfig] from the command line: configuration file first, then flags.
pub fn load(args: &CommandLineArgs) -> Result<AppConfig, ConfigurationError> {
    let mut config = AppConfig::new();
    if let Some(config_file) = &args.config_file {
        config.update_from_config_file(config_file)?;
    }
    config.update_server_config(args.server_config_overrides())?;
    Ok(config)
}

/// Return a copy of `base` with `patch` merged in.
fn merged(base: &Value, patch: Value, replaced: &[&[&str]]) -> Result<Value, ConfigurationError> {
    if !patch.is_object() {
        return Err(ConfigurationError::new(
            "configuration update must be a mapping of option names to values",
        ));
    }
    let mut tree = base.clone();
    merge_tree(&mut tree, patch, &mut Vec::new(), replaced);
    Ok(tree)
}

/// Recursively merge `patch` into `base`.
///
/// Mappings merge key by key except at the `replaced` paths; any other value replaces the
/// existing one.
fn merge_tree(base: &mut Value, patch: Value, path: &mut Vec<String>, replaced: &[&[&str]]) {
    let replace = replaced
        .iter()
        .any(|r| r.iter().copied().eq(path.iter().map(String::as_str)));
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) if !replace => {
            for (key, value) in patch {
                path.push(key.clone());
                merge_tree(base.entry(key).or_insert(Value::Null), value, path, replaced);
                path.pop();
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_context, FakeRegionDiscovery};
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn context_debug() {
        let env = HashMap::from([("CXG_SECRET_KEY".to_string(), "hunter2".to_string())]);
        let mut context = test_context().with_env(env);
        context.message("ready");
        let debug = format!("{:?}", context);
        assert_eq!(
            "ConfigContext { messages: [\"ready\"], cpu_count: 4, .. }",
            debug
        );
        assert!(!debug.contains("hunter2"));
    }

    fn base_config() -> AppConfig {
        let mut config = AppConfig::new();
        config
            .update_server_config(json!({
                "app": {"secret_key": "secret"},
                "multi_dataset": {"dataroot": "/data"},
            }))
            .unwrap();
        config
    }

    #[test]
    fn merge_nested_fields() {
        let mut tree = json!({"app": {"host": "localhost", "port": 1}});
        merge_tree(&mut tree, json!({"app": {"port": 2}}), &mut Vec::new(), &[]);
        assert_eq!(json!({"app": {"host": "localhost", "port": 2}}), tree);
    }

    #[test]
    fn merge_replaced_path() {
        let mut tree = json!({"multi_dataset": {"dataroot": {"a": {"base_url": "a"}}}});
        let patch = json!({"multi_dataset": {"dataroot": {"b": {"base_url": "b"}}}});
        merge_tree(&mut tree, patch, &mut Vec::new(), SERVER_REPLACED_PATHS);
        assert_eq!(
            json!({"multi_dataset": {"dataroot": {"b": {"base_url": "b"}}}}),
            tree
        );
    }

    #[test]
    fn update_unknown_key() {
        let mut config = AppConfig::new();
        let err = config
            .update_server_config(json!({"app": {"prot": 5005}}))
            .unwrap_err();
        assert!(err.to_string().contains("prot"), "{}", err);
    }

    #[test]
    fn update_unknown_section() {
        let mut config = AppConfig::new();
        let err = config
            .update_server_config(json!({"networking": {}}))
            .unwrap_err();
        assert!(err.to_string().contains("networking"), "{}", err);
    }

    #[test]
    fn update_wrong_type_leaves_config_untouched() {
        let mut config = AppConfig::new();
        config
            .update_server_config(json!({"app": {"port": 4000}}))
            .unwrap();
        assert!(config
            .update_server_config(json!({"app": {"port": "not_valid"}}))
            .is_err());
        assert!(config
            .update_server_config(json!({"app": {"port": 99999999}}))
            .is_err());
        assert_eq!(Some(4000), config.server_config.app.port);
    }

    #[test]
    fn update_not_a_mapping() {
        let mut config = AppConfig::new();
        assert!(config.update_server_config(json!("app")).is_err());
    }

    #[test]
    fn update_dataset_config() {
        let mut config = AppConfig::new();
        config
            .update_default_dataset_config(json!({"diffexp": {"top_n": 20}}))
            .unwrap();
        assert_eq!(20, config.default_dataset_config.diffexp.top_n);
        assert!(config
            .update_default_dataset_config(json!({"diffexp": {"top": 20}}))
            .is_err());
    }

    #[test]
    fn update_from_toml() {
        let mut config = AppConfig::new();
        config
            .update_from_toml(
                r#"
                [server.app]
                host = "0.0.0.0"
                secret_key = "from-file"

                [server.multi_dataset.dataroot.d1]
                base_url = "set1"
                dataroot = "/data/set1"

                [dataset.presentation]
                max_categories = 500
                "#,
            )
            .unwrap();
        assert_eq!("0.0.0.0", config.server_config.app.host);
        assert_eq!(500, config.default_dataset_config.presentation.max_categories);
    }

    #[test]
    fn update_from_toml_unknown_section() {
        let mut config = AppConfig::new();
        let err = config.update_from_toml("[servers.app]\nport = 1\n").unwrap_err();
        assert!(err.to_string().contains("servers"), "{}", err);
    }

    #[test]
    fn update_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server.app]\nport = 24").unwrap();
        let mut config = AppConfig::new();
        config.update_from_config_file(file.path()).unwrap();
        assert_eq!(Some(24), config.server_config.app.port);
    }

    #[test]
    fn update_from_missing_config_file() {
        let mut config = AppConfig::new();
        assert!(config
            .update_from_config_file("/nonexistent/config.toml")
            .is_err());
    }

    #[tokio::test]
    async fn complete_config() {
        let mut config = base_config();
        assert!(!config.is_completed());
        let mut context = test_context();
        config.complete_config(&mut context).await.unwrap();
        assert!(config.is_completed());
        config
            .update_server_config(json!({"app": {"verbose": true}}))
            .unwrap();
        assert!(!config.is_completed());
    }

    #[tokio::test]
    async fn environment_secret_wins_over_file() {
        let mut config = AppConfig::new();
        config
            .update_from_toml(
                "[server.app]\nsecret_key = \"KEY_FROM_FILE\"\n[server.multi_dataset]\ndataroot = \"/data\"\n",
            )
            .unwrap();
        let env = HashMap::from([("CXG_SECRET_KEY".to_string(), "KEY_FROM_ENV".to_string())]);
        let mut context = test_context().with_env(env);
        config.complete_config(&mut context).await.unwrap();
        assert_eq!(
            Some("KEY_FROM_ENV"),
            config.server_config.app.secret_key.as_ref().map(|s| s.expose())
        );
    }

    #[tokio::test]
    async fn external_binding_from_file() {
        let mut config = base_config();
        config
            .update_from_toml(
                r#"
                [[external.environment]]
                name = "PORTAL_API_BASE"
                path = ["data_locator", "api_base"]
                required = true
                "#,
            )
            .unwrap();
        let mut context = test_context();
        assert!(config.complete_config(&mut context).await.is_err());

        let env = HashMap::from([(
            "PORTAL_API_BASE".to_string(),
            "https://api.example.com/dp/v1".to_string(),
        )]);
        let mut context = test_context().with_env(env);
        config.complete_config(&mut context).await.unwrap();
        assert_eq!(
            Some("https://api.example.com/dp/v1".to_string()),
            config.server_config.data_locator.api_base
        );
    }

    #[tokio::test]
    async fn dataroot_dataset_config_overrides() {
        let mut config = base_config();
        config
            .update_default_dataset_config(json!({"app": {"about_legal_tos": "tos_default.html"}}))
            .unwrap();
        config
            .update_server_config(json!({"multi_dataset": {"dataroot": {
                "s1": {"base_url": "set1/1/2", "dataroot": "/data/set1"},
                "s2": {
                    "base_url": "set2",
                    "dataroot": "/data/set2",
                    "dataset_config": {"app": {"about_legal_tos": "tos_set2.html"}},
                },
            }}}))
            .unwrap();
        let mut context = test_context();
        config.complete_config(&mut context).await.unwrap();
        assert_eq!(
            Some("tos_default.html".to_string()),
            config.dataset_config(Some("s1")).app.about_legal_tos
        );
        assert_eq!(
            Some("tos_set2.html".to_string()),
            config.dataset_config(Some("s2")).app.about_legal_tos
        );
        assert_eq!(
            Some("tos_default.html".to_string()),
            config.dataset_config(None).app.about_legal_tos
        );
    }

    #[tokio::test]
    async fn dataroot_dataset_config_invalid() {
        let mut config = base_config();
        config
            .update_server_config(json!({"multi_dataset": {"dataroot": {
                "s1": {
                    "base_url": "set1",
                    "dataroot": "/data/set1",
                    "dataset_config": {"diffexp": {"top_n": "ten"}},
                },
            }}}))
            .unwrap();
        let mut context = test_context();
        let err = config.complete_config(&mut context).await.unwrap_err();
        assert!(err.to_string().contains("tag s1"), "{}", err);
    }

    #[test]
    fn context_messages() {
        let mut context =
            ConfigContext::new(Arc::new(FakeRegionDiscovery::new(None))).with_cpu_count(3);
        context.message("hello");
        assert_eq!(["hello".to_string()], context.messages());
        assert_eq!(3, context.cpu_count());
    }
}
