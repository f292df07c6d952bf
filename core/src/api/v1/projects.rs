use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::Deleted;
use crate::api::{ApiJson, ApiResult, ApiState};
use crate::charter::{heuristic_validation, HeuristicValidation};
use crate::db::DEMO_USER_ID;
use crate::models::projects::{
    create_project, delete_project, get_project, list_projects, update_project, Project,
    ProjectCreate, ProjectPage, ProjectUpdate,
};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/projects", get(list).post(create))
        .route("/projects/validate-charter", post(validate_charter))
        .route("/projects/:id", get(show).put(update).delete(remove))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    search: Option<String>,
}

fn default_limit() -> i64 {
    100
}

async fn list(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ProjectPage>> {
    let page = state
        .with_conn(move |conn| {
            list_projects(conn, DEMO_USER_ID, query.skip, query.limit, query.search.as_deref())
        })
        .await?;
    Ok(Json(page))
}

async fn create(
    State(state): State<ApiState>,
    ApiJson(input): ApiJson<ProjectCreate>,
) -> ApiResult<Json<Project>> {
    let project = state
        .with_conn(move |conn| create_project(conn, DEMO_USER_ID, &input))
        .await?;
    log::info!("project {} created", project.id);
    Ok(Json(project))
}

async fn show(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Project>> {
    let project = state
        .with_conn(move |conn| get_project(conn, DEMO_USER_ID, id))
        .await?;
    Ok(Json(project))
}

async fn update(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<ProjectUpdate>,
) -> ApiResult<Json<Project>> {
    let project = state
        .with_conn(move |conn| update_project(conn, DEMO_USER_ID, id, &input))
        .await?;
    Ok(Json(project))
}

async fn remove(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Deleted>> {
    state
        .with_conn(move |conn| delete_project(conn, DEMO_USER_ID, id))
        .await?;
    log::info!("project {id} deleted");
    Ok(Json(Deleted::entity("Project")))
}

#[derive(Debug, Deserialize)]
struct CharterTextQuery {
    charter_text: String,
}

/// Offline check, no provider involved.
async fn validate_charter(Query(query): Query<CharterTextQuery>) -> Json<HeuristicValidation> {
    Json(heuristic_validation(&query.charter_text))
}
