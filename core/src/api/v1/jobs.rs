use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::api::{ApiResult, ApiState};
use crate::db::DEMO_USER_ID;
use crate::logging::log_event;
use crate::models::projects::get_project;
use crate::workers::{enqueue_job, fail_job, get_job, JobRecord, CHARTER_VALIDATE};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/projects/:id/charter/review", post(review_charter))
        .route("/jobs/:job_id", get(show))
}

/// Inserts the job row, then hands its id to the transport. A transport
/// failure marks the row failed so it is never picked up later.
pub(super) async fn enqueue(state: &ApiState, kind: &'static str, payload: Value) -> ApiResult<JobRecord> {
    let job = state
        .with_conn(move |conn| {
            let id = enqueue_job(conn, kind, payload)?;
            log_event(
                conn,
                "info",
                Some("JOB-0000"),
                "workers",
                "job queued",
                None,
                Some(json!({ "id": id, "kind": kind })),
            )?;
            get_job(conn, &id)
        })
        .await?;

    if let Err(err) = state.queue.push(&job.id).await {
        log::error!("failed to publish job {}: {err}", job.id);
        let id = job.id.clone();
        let message = err.to_string();
        state
            .with_conn(move |conn| Ok(fail_job(conn, &id, &message)?))
            .await?;
        return Err(err.into());
    }
    Ok(job)
}

async fn review_charter(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    state
        .with_conn(move |conn| get_project(conn, DEMO_USER_ID, project_id))
        .await?;
    let job = enqueue(&state, CHARTER_VALIDATE, json!({ "project_id": project_id })).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn show(State(state): State<ApiState>, Path(job_id): Path<String>) -> ApiResult<Json<JobRecord>> {
    let job = state
        .with_conn(move |conn| get_job(conn, &job_id))
        .await?;
    Ok(Json(job))
}
