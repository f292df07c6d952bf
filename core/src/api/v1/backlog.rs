//! Epics, stories, use cases and test cases. Parents are looked up first so a
//! missing parent is a 404 rather than a foreign-key conflict.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use super::Deleted;
use crate::api::{ApiJson, ApiResult, ApiState};
use crate::models::backlog::{
    create_epic, create_story, create_test_case, create_use_case, delete_epic, delete_story,
    delete_test_case, delete_use_case, get_epic, get_story, get_test_case, get_use_case,
    list_epics, list_stories, list_test_cases, list_use_cases, update_epic, update_story,
    update_test_case, update_use_case, Epic, EpicCreate, EpicUpdate, StoryCreate, StoryUpdate,
    TestCase, TestCaseCreate, TestCaseUpdate, UseCase, UseCaseCreate, UseCaseUpdate, UserStory,
};
use crate::models::releases::find_release;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/releases/:id/epics", get(epics).post(new_epic))
        .route("/epics/:id", get(epic).put(edit_epic).delete(drop_epic))
        .route("/epics/:id/stories", get(stories).post(new_story))
        .route("/stories/:id", get(story).put(edit_story).delete(drop_story))
        .route("/stories/:id/use-cases", get(use_cases).post(new_use_case))
        .route("/stories/:id/test-cases", get(test_cases).post(new_test_case))
        .route(
            "/use-cases/:id",
            get(use_case).put(edit_use_case).delete(drop_use_case),
        )
        .route(
            "/test-cases/:id",
            get(test_case).put(edit_test_case).delete(drop_test_case),
        )
}

// Epics

async fn epics(State(state): State<ApiState>, Path(release_id): Path<i64>) -> ApiResult<Json<Vec<Epic>>> {
    let epics = state
        .with_conn(move |conn| {
            find_release(conn, release_id)?;
            list_epics(conn, release_id)
        })
        .await?;
    Ok(Json(epics))
}

async fn new_epic(
    State(state): State<ApiState>,
    Path(release_id): Path<i64>,
    ApiJson(input): ApiJson<EpicCreate>,
) -> ApiResult<Json<Epic>> {
    let epic = state
        .with_conn(move |conn| {
            find_release(conn, release_id)?;
            create_epic(conn, release_id, &input)
        })
        .await?;
    Ok(Json(epic))
}

async fn epic(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Epic>> {
    Ok(Json(state.with_conn(move |conn| get_epic(conn, id)).await?))
}

async fn edit_epic(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<EpicUpdate>,
) -> ApiResult<Json<Epic>> {
    Ok(Json(
        state.with_conn(move |conn| update_epic(conn, id, &input)).await?,
    ))
}

async fn drop_epic(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Deleted>> {
    state.with_conn(move |conn| delete_epic(conn, id)).await?;
    Ok(Json(Deleted::entity("Epic")))
}

// User stories

async fn stories(
    State(state): State<ApiState>,
    Path(epic_id): Path<i64>,
) -> ApiResult<Json<Vec<UserStory>>> {
    let stories = state
        .with_conn(move |conn| {
            get_epic(conn, epic_id)?;
            list_stories(conn, epic_id)
        })
        .await?;
    Ok(Json(stories))
}

async fn new_story(
    State(state): State<ApiState>,
    Path(epic_id): Path<i64>,
    ApiJson(input): ApiJson<StoryCreate>,
) -> ApiResult<Json<UserStory>> {
    let story = state
        .with_conn(move |conn| {
            get_epic(conn, epic_id)?;
            create_story(conn, epic_id, &input)
        })
        .await?;
    Ok(Json(story))
}

async fn story(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<UserStory>> {
    Ok(Json(state.with_conn(move |conn| get_story(conn, id)).await?))
}

async fn edit_story(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<StoryUpdate>,
) -> ApiResult<Json<UserStory>> {
    Ok(Json(
        state.with_conn(move |conn| update_story(conn, id, &input)).await?,
    ))
}

async fn drop_story(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Deleted>> {
    state.with_conn(move |conn| delete_story(conn, id)).await?;
    Ok(Json(Deleted::entity("User story")))
}

// Use cases

async fn use_cases(
    State(state): State<ApiState>,
    Path(story_id): Path<i64>,
) -> ApiResult<Json<Vec<UseCase>>> {
    let cases = state
        .with_conn(move |conn| {
            get_story(conn, story_id)?;
            list_use_cases(conn, story_id)
        })
        .await?;
    Ok(Json(cases))
}

async fn new_use_case(
    State(state): State<ApiState>,
    Path(story_id): Path<i64>,
    ApiJson(input): ApiJson<UseCaseCreate>,
) -> ApiResult<Json<UseCase>> {
    let case = state
        .with_conn(move |conn| {
            get_story(conn, story_id)?;
            create_use_case(conn, story_id, &input)
        })
        .await?;
    Ok(Json(case))
}

async fn use_case(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<UseCase>> {
    Ok(Json(state.with_conn(move |conn| get_use_case(conn, id)).await?))
}

async fn edit_use_case(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<UseCaseUpdate>,
) -> ApiResult<Json<UseCase>> {
    Ok(Json(
        state
            .with_conn(move |conn| update_use_case(conn, id, &input))
            .await?,
    ))
}

async fn drop_use_case(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Deleted>> {
    state.with_conn(move |conn| delete_use_case(conn, id)).await?;
    Ok(Json(Deleted::entity("Use case")))
}

// Test cases

async fn test_cases(
    State(state): State<ApiState>,
    Path(story_id): Path<i64>,
) -> ApiResult<Json<Vec<TestCase>>> {
    let cases = state
        .with_conn(move |conn| {
            get_story(conn, story_id)?;
            list_test_cases(conn, story_id)
        })
        .await?;
    Ok(Json(cases))
}

async fn new_test_case(
    State(state): State<ApiState>,
    Path(story_id): Path<i64>,
    ApiJson(input): ApiJson<TestCaseCreate>,
) -> ApiResult<Json<TestCase>> {
    let case = state
        .with_conn(move |conn| {
            get_story(conn, story_id)?;
            create_test_case(conn, story_id, &input)
        })
        .await?;
    Ok(Json(case))
}

async fn test_case(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<TestCase>> {
    Ok(Json(state.with_conn(move |conn| get_test_case(conn, id)).await?))
}

async fn edit_test_case(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<TestCaseUpdate>,
) -> ApiResult<Json<TestCase>> {
    Ok(Json(
        state
            .with_conn(move |conn| update_test_case(conn, id, &input))
            .await?,
    ))
}

async fn drop_test_case(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Deleted>> {
    state.with_conn(move |conn| delete_test_case(conn, id)).await?;
    Ok(Json(Deleted::entity("Test case")))
}
