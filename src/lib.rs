//! infer-router - A load-balancing router for inference backends
//!
//! Backends register themselves over HTTP and optionally push load reports over ZeroMQ. Each
//! generation request is forwarded to one backend chosen by the configured strategy, and the
//! backend's response is streamed back to the caller.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod client;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod load_balancer;
pub mod models;
pub mod registry;
pub mod stats;

use client::HttpClient;
use controller::Controller;
use handlers::{generate, get_model_info, register_nodes, v1_completions};

/// The application state shared by every handler
#[derive(Debug)]
pub struct AppState<T: HttpClient> {
    pub controller: Arc<Controller<T>>,
    /// Log the body of every generation request.
    pub log_requests: bool,
}

impl<T: HttpClient> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            log_requests: self.log_requests,
        }
    }
}

impl<T: HttpClient> AppState<T> {
    pub fn new(controller: Controller<T>) -> Self {
        Self {
            controller: Arc::new(controller),
            log_requests: false,
        }
    }

    pub fn with_log_requests(mut self, log_requests: bool) -> Self {
        self.log_requests = log_requests;
        self
    }
}

/// Build the main router
/// This creates routes for:
/// - `/register_nodes` - Adds a backend
/// - `/generate` and `/v1/completions` - Forwards to a backend picked by the load balancer
/// - `/get_model_info` - Describes the model served by the first backend
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/register_nodes", post(register_nodes::<T>))
        .route("/generate", post(generate::<T>))
        .route("/v1/completions", post(v1_completions::<T>))
        .route("/get_model_info", get(get_model_info::<T>))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection, labelling series by exact path.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
