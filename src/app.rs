use crate::app_state::{AppState, SharedAppState};
use crate::dataset_route::{DatasetRequest, DatasetRoute};
use crate::error::DatasetAccessError;
use crate::matrix_loader::{self, MatrixDataset};
use crate::metrics;
use crate::models::{
    ClientConfig, ConfigResponse, DatasetMetadataBody, DatasetMetadataResponse, HealthResponse,
    SchemaResponse,
};
use crate::resolver::{Resolution, ResolvedDataset};

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use tower::ServiceBuilder;
use tower_http::normalize_path::NormalizePath;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tower_http::validate_request::ValidateRequestHeaderLayer;

/// Versions of the dataset API served.
const API_VERSIONS: [&str; 2] = ["v0.2", "v0.3"];

const HSTS_POLICY: &str = "max-age=31536000; includeSubDomains";

/// The cellxgene service type
pub type Service = NormalizePath<Router>;

/// Returns a [crate::app::Service] with all routes, trailing slashes trimmed.
pub fn service(state: SharedAppState) -> Service {
    NormalizePath::trim_trailing_slash(router(state))
}

/// Returns a [axum::Router] with all routes.
///
/// Every dataroot gets the dataset API below its base URL. In single dataset mode the dataset
/// API is served from the root.
pub fn router(state: SharedAppState) -> Router {
    fn dataset_api(prefix: &str, route: DatasetRoute) -> Router<SharedAppState> {
        let mut router = Router::new();
        for version in API_VERSIONS {
            let base = format!("{}/api/{}", prefix, version);
            router = router
                .route(&format!("{}/config", base), get(config))
                .route(&format!("{}/schema", base), get(schema))
                .route(&format!("{}/dataset-metadata", base), get(dataset_metadata))
                .route(&format!("{}/s3_uri", base), get(s3_uri));
        }
        router.layer(
            ServiceBuilder::new()
                .layer(Extension(route))
                .layer(ValidateRequestHeaderLayer::accept(
                    mime::APPLICATION_JSON.as_ref(),
                )),
        )
    }

    let server_config = &state.config.server_config;
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics::metrics_handler));
    for dataroot in server_config.dataroots() {
        let route = DatasetRoute::Dataroot {
            tag: dataroot.tag.clone(),
        };
        router = router.nest(
            &format!("/{}", dataroot.base_url),
            dataset_api("/:dataset", route),
        );
    }
    if let Some(datapath) = &server_config.single_dataset.datapath {
        let route = DatasetRoute::Single {
            dataset: matrix_loader::basename(datapath).to_string(),
        };
        router = router.merge(dataset_api("", route));
    }

    if server_config.app.generate_cache_control_headers {
        router = router.layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));
    }
    if server_config.app.force_https {
        router = router.layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_POLICY),
        ));
    }

    router
        .layer(
            TraceLayer::new_for_http()
                .on_request(metrics::request_counter)
                .on_response(metrics::record_response_metrics),
        )
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "pass" })
}

/// Redirect a client to another URL.
fn redirect(url: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
}

/// Load a resolved dataset.
///
/// A failed load evicts the cached location so that the next request resolves it afresh.
async fn load(state: &AppState, resolved: &ResolvedDataset) -> Result<MatrixDataset, DatasetAccessError> {
    match state.matrix_store.open(&resolved.location).await {
        Ok(dataset) => Ok(dataset),
        Err(err) => {
            tracing::warn!("failed to load {}: {}", resolved.location, err);
            state.resolver.evict(&resolved.key).await;
            Err(DatasetAccessError::LoadFailed {
                location: resolved.location.clone(),
                source: Box::new(err),
            })
        }
    }
}

async fn config(
    State(state): State<SharedAppState>,
    DatasetRequest(key): DatasetRequest,
) -> Result<Response, DatasetAccessError> {
    let resolved = match state.resolver.resolve(&key).await? {
        Resolution::Located(resolved) => resolved,
        Resolution::Redirect(url) => return Ok(redirect(&url)),
    };
    let dataset = load(&state, &resolved).await?;
    let server_config = &state.config.server_config;
    let name = match (&key.tag, &server_config.single_dataset.title) {
        (None, Some(title)) => title.clone(),
        _ => dataset.name,
    };
    let dataset_config = state.config.dataset_config(key.tag.as_deref());
    let config = ClientConfig::new(server_config, dataset_config, name);
    Ok(Json(ConfigResponse { config }).into_response())
}

async fn schema(
    State(state): State<SharedAppState>,
    DatasetRequest(key): DatasetRequest,
) -> Result<Response, DatasetAccessError> {
    let resolved = match state.resolver.resolve(&key).await? {
        Resolution::Located(resolved) => resolved,
        Resolution::Redirect(url) => return Ok(redirect(&url)),
    };
    let dataset = load(&state, &resolved).await?;
    Ok(Json(SchemaResponse {
        schema: dataset.schema,
    })
    .into_response())
}

async fn dataset_metadata(
    State(state): State<SharedAppState>,
    DatasetRequest(key): DatasetRequest,
) -> Result<Response, DatasetAccessError> {
    let resolved = match state.resolver.resolve(&key).await? {
        Resolution::Located(resolved) => resolved,
        Resolution::Redirect(url) => return Ok(redirect(&url)),
    };
    let not_found = || DatasetAccessError::MetadataNotFound {
        dataset: key.dataset.clone(),
    };
    let metadata = resolved.metadata.ok_or_else(not_found)?;
    let portal = state.resolver.portal().ok_or_else(not_found)?;
    let collection = portal
        .collection(&metadata.collection_id, metadata.collection_visibility)
        .await
        .map_err(|source| DatasetAccessError::CollectionUnavailable {
            collection_id: metadata.collection_id.clone(),
            source,
        })?;
    let web_base_url = state.resolver.web_base_url().unwrap_or_default();
    Ok(Json(DatasetMetadataResponse {
        metadata: DatasetMetadataBody::new(&metadata, collection, web_base_url),
    })
    .into_response())
}

async fn s3_uri(
    State(state): State<SharedAppState>,
    DatasetRequest(key): DatasetRequest,
) -> Result<Response, DatasetAccessError> {
    let resolved = match state.resolver.resolve(&key).await? {
        Resolution::Located(resolved) => resolved,
        Resolution::Redirect(url) => return Ok(redirect(&url)),
    };
    let dataset = load(&state, &resolved).await?;
    Ok(Json(dataset.location).into_response())
}
