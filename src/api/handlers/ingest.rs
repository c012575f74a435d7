use crate::AppState;
use crate::api::error::AppError;
use crate::config::IngestSettings;
use crate::services::ingest::IngestReport;
use axum::{Json, extract::State};
use tracing::info;

#[utoipa::path(
    post,
    path = "/api/kaggleingest",
    responses(
        (status = 200, description = "Dataset downloaded, converted and uploaded", body = IngestReport),
        (status = 400, description = "Missing setting or missing provider credentials"),
        (status = 500, description = "Secret store, dataset provider or storage failure")
    ),
    tag = "ingest"
)]
pub async fn kaggle_ingest(State(state): State<AppState>) -> Result<Json<IngestReport>, AppError> {
    info!("Ingestion started");

    // nothing upstream is touched until every setting is present
    let settings = IngestSettings::load(&state.env)?;
    let report = state.ingest.run(&settings).await?;

    Ok(Json(report))
}
