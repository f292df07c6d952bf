use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use super::jobs::enqueue;
use super::Deleted;
use crate::api::{ApiJson, ApiResult, ApiState};
use crate::db::DEMO_USER_ID;
use crate::errors::PlanFlowError;
use crate::models::projects::get_project;
use crate::models::releases::{
    create_release, delete_release, get_release, list_releases, refresh_progress, update_release,
    Release, ReleaseCreate, ReleaseList, ReleaseUpdate,
};
use crate::release_planner::{
    create_from_extraction, project_charter, BulkReleaseCreation, CreateFromExtraction,
    ReleaseExtraction,
};
use crate::workers::{JobRecord, RELEASE_EXTRACT};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/projects/:id/releases", get(list).post(create))
        .route("/projects/:id/releases/extract", post(extract))
        .route("/projects/:id/releases/extract-async", post(extract_async))
        .route(
            "/projects/:id/releases/create-from-extraction",
            post(create_extracted),
        )
        .route(
            "/projects/:id/releases/:rid",
            get(show).put(update).delete(remove),
        )
        .route(
            "/projects/:id/releases/:rid/update-progress",
            post(update_progress),
        )
}

async fn list(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<ReleaseList>> {
    let releases = state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            list_releases(conn, project_id)
        })
        .await?;
    Ok(Json(releases))
}

async fn create(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
    ApiJson(input): ApiJson<ReleaseCreate>,
) -> ApiResult<Json<Release>> {
    let release = state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            create_release(conn, project_id, &input)
        })
        .await?;
    log::info!("release {} created for project {project_id}", release.id);
    Ok(Json(release))
}

async fn show(
    State(state): State<ApiState>,
    Path((project_id, id)): Path<(i64, i64)>,
) -> ApiResult<Json<Release>> {
    let release = state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            get_release(conn, project_id, id)
        })
        .await?;
    Ok(Json(release))
}

async fn update(
    State(state): State<ApiState>,
    Path((project_id, id)): Path<(i64, i64)>,
    ApiJson(input): ApiJson<ReleaseUpdate>,
) -> ApiResult<Json<Release>> {
    let release = state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            update_release(conn, project_id, id, &input)
        })
        .await?;
    Ok(Json(release))
}

async fn remove(
    State(state): State<ApiState>,
    Path((project_id, id)): Path<(i64, i64)>,
) -> ApiResult<Json<Deleted>> {
    state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            delete_release(conn, project_id, id)
        })
        .await?;
    Ok(Json(Deleted::entity("Release")))
}

/// Recomputes progress from epic completion and stores it.
async fn update_progress(
    State(state): State<ApiState>,
    Path((project_id, id)): Path<(i64, i64)>,
) -> ApiResult<Json<Release>> {
    let release = state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            refresh_progress(conn, project_id, id)
        })
        .await?;
    Ok(Json(release))
}

async fn extract(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<ReleaseExtraction>> {
    let project = state
        .with_conn(move |conn| get_project(conn, DEMO_USER_ID, project_id))
        .await?;
    let extraction = state.planner.extract(&project).await?;
    log::info!(
        "extracted {} release(s) for project {project_id} ({:?})",
        extraction.plan.extracted_releases.len(),
        extraction.ai_status
    );
    Ok(Json(extraction))
}

async fn extract_async(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let project = state
        .with_conn(move |conn| get_project(conn, DEMO_USER_ID, project_id))
        .await?;
    if project_charter(&project).is_none() {
        return Err(PlanFlowError::CharterMissing.into());
    }
    let job = enqueue(&state, RELEASE_EXTRACT, json!({ "project_id": project_id })).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn create_extracted(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
    ApiJson(input): ApiJson<CreateFromExtraction>,
) -> ApiResult<Json<BulkReleaseCreation>> {
    let result = state
        .with_conn(move |conn| {
            get_project(conn, DEMO_USER_ID, project_id)?;
            Ok(create_from_extraction(
                conn,
                project_id,
                &input.extracted_data,
                &input.selected_releases,
            ))
        })
        .await?;
    log::info!(
        "created {}/{} extracted release(s) for project {project_id}",
        result.success_count,
        result.total_count
    );
    Ok(Json(result))
}
