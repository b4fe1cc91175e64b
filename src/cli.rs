//! Command Line Interface (CLI) arguments.

use clap::Parser;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

/// cellxgene server command line interface
///
/// Options given here take priority over the configuration file.
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// Path to a TOML configuration file
    #[arg(long, env = "CXG_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
    /// The host name or IP address on which the server should listen
    #[arg(long, env = "CXG_HOST")]
    pub host: Option<String>,
    /// The port to which the server should bind. If omitted, an available port is chosen
    #[arg(long, env = "CXG_PORT")]
    pub port: Option<u16>,
    /// Directory or object store root containing datasets to serve
    #[arg(long, env = "CXG_DATAROOT", conflicts_with = "datapath")]
    pub dataroot: Option<String>,
    /// Path or URI of a single dataset to serve
    #[arg(long, env = "CXG_DATAPATH")]
    pub datapath: Option<String>,
    /// Enable debug mode
    #[arg(long, default_value_t = false, env = "CXG_DEBUG")]
    pub debug: bool,
    /// Enable verbose logging
    #[arg(long, default_value_t = false, env = "CXG_VERBOSE")]
    pub verbose: bool,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "CXG_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/cellxgene/certs/cert.pem",
        env = "CXG_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/cellxgene/certs/key.pem",
        env = "CXG_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for requests to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "CXG_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
}

impl CommandLineArgs {
    /// Server configuration fields set on the command line.
    ///
    /// Options that were not given are omitted so that they do not mask the configuration file.
    pub fn server_config_overrides(&self) -> Value {
        let mut app = Map::new();
        if let Some(host) = &self.host {
            app.insert("host".to_string(), json!(host));
        }
        if let Some(port) = self.port {
            app.insert("port".to_string(), json!(port));
        }
        if self.debug {
            app.insert("debug".to_string(), json!(true));
        }
        if self.verbose {
            app.insert("verbose".to_string(), json!(true));
        }

        let mut overrides = Map::new();
        if !app.is_empty() {
            overrides.insert("app".to_string(), Value::Object(app));
        }
        if let Some(dataroot) = &self.dataroot {
            overrides.insert("multi_dataset".to_string(), json!({ "dataroot": dataroot }));
        }
        if let Some(datapath) = &self.datapath {
            overrides.insert("single_dataset".to_string(), json!({ "datapath": datapath }));
        }
        Value::Object(overrides)
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> CommandLineArgs {
        CommandLineArgs::try_parse_from(std::iter::once("cellxgene-server").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn no_overrides() {
        let args = CommandLineArgs {
            config_file: None,
            host: None,
            port: None,
            dataroot: None,
            datapath: None,
            debug: false,
            verbose: false,
            https: false,
            cert_file: "cert.pem".to_string(),
            key_file: "key.pem".to_string(),
            graceful_shutdown_timeout: 60,
        };
        assert_eq!(json!({}), args.server_config_overrides());
    }

    #[test]
    fn overrides() {
        let args = args(&[
            "--host",
            "0.0.0.0",
            "--port",
            "5006",
            "--dataroot",
            "s3://cellxgene/sets",
            "--verbose",
        ]);
        assert_eq!(
            json!({
                "app": {"host": "0.0.0.0", "port": 5006, "verbose": true},
                "multi_dataset": {"dataroot": "s3://cellxgene/sets"},
            }),
            args.server_config_overrides()
        );
    }

    #[test]
    fn datapath() {
        let args = args(&["--datapath", "/data/pbmc3k.cxg", "--debug"]);
        assert_eq!(
            json!({
                "app": {"debug": true},
                "single_dataset": {"datapath": "/data/pbmc3k.cxg"},
            }),
            args.server_config_overrides()
        );
    }

    #[test]
    fn dataroot_conflicts_with_datapath() {
        let result = CommandLineArgs::try_parse_from([
            "cellxgene-server",
            "--dataroot",
            "/data",
            "--datapath",
            "/data/pbmc3k.cxg",
        ]);
        assert!(result.is_err());
    }
}
