//! Environment bindings.
//!
//! A binding copies the value of an environment variable into the server configuration tree
//! before it is validated, so environment values take priority over every other source.

use crate::config::server::ServerConfig;
use crate::config::ConfigContext;
use crate::error::ConfigurationError;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Environment variable holding the session secret.
pub const SECRET_KEY_ENV: &str = "CXG_SECRET_KEY";

/// Binding of an environment variable to a server configuration path.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentBinding {
    /// Name of the environment variable.
    pub name: String,
    /// Path of the option in the server configuration, e.g. `["app", "secret_key"]`.
    pub path: Vec<String>,
    /// Whether the variable must be set.
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ExternalConfig {
    pub environment: Vec<EnvironmentBinding>,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            environment: vec![EnvironmentBinding {
                name: SECRET_KEY_ENV.to_string(),
                path: vec!["app".to_string(), "secret_key".to_string()],
                required: false,
            }],
        }
    }
}

impl ExternalConfig {
    /// Parse an `external` configuration section. Built-in bindings are not included.
    pub(crate) fn from_tree(tree: Value) -> Result<Self, ConfigurationError> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Section {
            #[serde(default)]
            environment: Vec<EnvironmentBinding>,
        }
        let section: Section = serde_json::from_value(tree).map_err(|err| {
            ConfigurationError::new(format!("Invalid external configuration: {}", err))
        })?;
        Ok(Self {
            environment: section.environment,
        })
    }

    /// Write the value of every bound environment variable into a server configuration tree.
    ///
    /// Boolean and numeric values are written as such when the resulting tree still parses as a
    /// server configuration; every other value is written as a string.
    pub fn handle_environment(&self, context: &ConfigContext, tree: &mut Value) -> Result<(), ConfigurationError> {
        for binding in &self.environment {
            match context.var(&binding.name) {
                Some(value) => {
                    let invalid = |reason: &str| {
                        ConfigurationError::new(format!(
                            "Invalid environment binding {}: {}",
                            binding.name, reason
                        ))
                    };
                    if let Some(scalar) = scalar_value(value) {
                        let mut candidate = tree.clone();
                        set_path(&mut candidate, &binding.path, scalar).map_err(invalid)?;
                        if ServerConfig::from_tree(&candidate).is_ok() {
                            *tree = candidate;
                            continue;
                        }
                    }
                    set_path(tree, &binding.path, Value::String(value.to_string()))
                        .map_err(invalid)?;
                }
                None if binding.required => {
                    return Err(ConfigurationError::new(format!(
                        "required environment variable {} is not set",
                        binding.name
                    )))
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Parse an environment value holding a boolean or a number.
fn scalar_value(value: &str) -> Option<Value> {
    serde_json::from_str::<Value>(value.trim())
        .ok()
        .filter(|value| value.is_boolean() || value.is_number())
}

/// Set a value in a tree of mappings, creating intermediate mappings as needed.
fn set_path(tree: &mut Value, path: &[String], value: Value) -> Result<(), &'static str> {
    let Some((last, parents)) = path.split_last() else {
        return Err("path must not be empty");
    };
    let mut node = tree;
    for key in parents {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
            _ => return Err("path does not name a configuration section"),
        };
    }
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        _ => Err("path does not name a configuration section"),
    }
}
