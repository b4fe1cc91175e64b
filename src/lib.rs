//! This crate provides the backend of cellxgene, a browser-based viewer of single-cell gene
//! expression datasets. It serves the client configuration, schema and portal metadata of
//! datasets found in one or more dataroots, or of a single dataset.
//!
//! Datasets are located by asking a data portal where the published copy of a dataset lives,
//! falling back to the dataroot the request was routed to. Portal answers are cached, and a
//! cached location is forgotten as soon as loading from it fails. Datasets the portal reports as
//! tombstoned are redirected to their collection page.
//!
//! The server is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of configuration and JSON response data.
//! * [reqwest] queries the data portal.
//! * [AWS SDK for S3](aws-sdk-s3) is used to read datasets from S3-compatible object stores and
//!   to discover their region.

pub mod app;
pub mod app_state;
pub mod cli;
pub mod compute;
pub mod config;
pub mod data_portal;
pub mod dataset_route;
pub mod error;
pub mod matrix_loader;
pub mod metadata_cache;
pub mod metrics;
pub mod models;
pub mod port;
pub mod resolver;
pub mod s3_client;
pub mod server;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
