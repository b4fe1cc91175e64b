//! This file defines the cellxgene server binary entry point.

use cellxgene_server::app;
use cellxgene_server::app_state::AppState;
use cellxgene_server::cli;
use cellxgene_server::config::{self, ConfigContext};
use cellxgene_server::metrics;
use cellxgene_server::s3_client::{S3Credentials, S3RegionDiscovery};
use cellxgene_server::server;
use cellxgene_server::tracing;

use std::process::exit;
use std::sync::Arc;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    metrics::register_metrics();

    let mut config = match config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            tracing::init_tracing(args.verbose || args.debug);
            ::tracing::error!("{}", err);
            exit(1)
        }
    };
    let discovery = Arc::new(S3RegionDiscovery::new(S3Credentials::from_env()));
    let mut context = ConfigContext::new(discovery);
    let completed = config.complete_config(&mut context).await;

    // Verbosity is only known once the configuration is complete.
    tracing::init_tracing(config.server_config.app.verbose || args.verbose || args.debug);
    for message in context.messages() {
        ::tracing::info!("{}", message);
    }
    if let Err(err) = completed {
        ::tracing::error!("{}", err);
        exit(1)
    }

    let state = match AppState::new(config) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            ::tracing::error!("{}", err);
            exit(1)
        }
    };
    let service = app::service(state.clone());
    server::serve(&args, &state.config.server_config, service).await;
}
