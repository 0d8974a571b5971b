use std::sync::Arc;

use axum::{Router, routing::get};
use speedtest_common::error::{Result, SpeedtestError};
use speedtest_metrics::MetricsRegistry;
use tower_http::trace::TraceLayer;

use crate::handlers;

pub struct ExporterState {
    pub registry: Arc<MetricsRegistry>,
    pub metrics_path: String,
}

impl ExporterState {
    pub fn new(registry: Arc<MetricsRegistry>, metrics_path: impl Into<String>) -> Result<Self> {
        let metrics_path = metrics_path.into();
        if !metrics_path.starts_with('/') || metrics_path == "/" {
            return Err(SpeedtestError::InvalidArgument(format!(
                "metrics path must be an absolute path other than '/': {metrics_path:?}"
            )));
        }

        Ok(Self {
            registry,
            metrics_path,
        })
    }
}

pub fn exporter_router(state: Arc<ExporterState>) -> Router {
    Router::new()
        .route("/", get(handlers::landing::landing_page))
        .route(
            &state.metrics_path,
            get(handlers::metrics::prometheus_metrics),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
