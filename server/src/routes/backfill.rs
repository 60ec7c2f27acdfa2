use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    backfill::{BackfillRegistry, JobSnapshot, StartOutcome},
    error::{AppJsonResult, AppResult},
};

/// # POST /backfill/jobs

#[derive(Deserialize)]
pub struct StartJobBody {
    pub language: String,
    pub workers: Option<usize>,
    pub delay_ms: Option<u64>,
}

#[derive(Serialize, Debug)]
pub struct StartJobResponse {
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn start_job(
    State(registry): State<BackfillRegistry>,
    Json(body): Json<StartJobBody>,
) -> AppResult<(StatusCode, Json<StartJobResponse>)> {
    let outcome = registry
        .start(&body.language, body.workers, body.delay_ms)
        .await?;

    let response = match outcome {
        StartOutcome::Started(job_id) => (
            StatusCode::ACCEPTED,
            Json(StartJobResponse {
                job_id: Some(job_id),
                message: None,
            }),
        ),
        StartOutcome::NothingToDo => (
            StatusCode::OK,
            Json(StartJobResponse {
                job_id: None,
                message: Some(format!("No unfilled items for '{}'", body.language.trim())),
            }),
        ),
    };

    Ok(response)
}

/// # GET /backfill/jobs
pub async fn list_jobs(State(registry): State<BackfillRegistry>) -> AppJsonResult<Vec<JobSnapshot>> {
    Ok(Json(registry.list().await))
}

/// # GET /backfill/jobs/:id
pub async fn get_job(
    State(registry): State<BackfillRegistry>,
    Path(id): Path<Uuid>,
) -> AppJsonResult<JobSnapshot> {
    Ok(Json(registry.status(id).await?))
}

/// # POST /backfill/jobs/:id/stop
pub async fn stop_job(
    State(registry): State<BackfillRegistry>,
    Path(id): Path<Uuid>,
) -> AppJsonResult<JobSnapshot> {
    Ok(Json(registry.stop(id).await?))
}

#[derive(Serialize, Debug)]
pub struct StopAllResponse {
    pub stopped: usize,
}

/// # POST /backfill/stop
pub async fn stop_all(State(registry): State<BackfillRegistry>) -> AppJsonResult<StopAllResponse> {
    let stopped = registry.stop_all().await;
    tracing::info!("Stop requested, {} backfill jobs signalled", stopped);
    Ok(Json(StopAllResponse { stopped }))
}
