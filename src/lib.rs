pub mod api;
pub mod config;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::{AppConfig, EnvSource};
use crate::services::ingest::{IngestBackends, IngestService};
use axum::{
    Router,
    middleware::from_fn,
    routing::{any, get},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::ingest::kaggle_ingest,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            services::ingest::IngestReport,
            services::ingest::SkippedFile,
            api::handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "ingest", description = "Dataset ingestion"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub env: EnvSource,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(backends: Arc<dyn IngestBackends>, config: AppConfig, env: EnvSource) -> Self {
        Self {
            ingest: Arc::new(IngestService::new(backends, config.clone())),
            env,
            config,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/api/kaggleingest",
            any(api::handlers::ingest::kaggle_ingest),
        )
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .with_state(state)
}
