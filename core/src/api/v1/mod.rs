//! Version 1 of the HTTP API, mounted under `/api/v1`.

mod backlog;
mod charter;
mod jobs;
mod projects;
mod releases;

use axum::routing::get;
use axum::Router;
use serde::Serialize;

use super::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .merge(projects::routes())
        .merge(releases::routes())
        .merge(backlog::routes())
        .nest("/charter", charter::routes())
        .merge(jobs::routes())
        .route("/events", get(super::events))
}

/// Body returned by delete endpoints.
#[derive(Debug, Serialize)]
pub struct Deleted {
    pub message: String,
}

impl Deleted {
    fn entity(name: &str) -> Self {
        Self {
            message: format!("{name} deleted successfully"),
        }
    }
}
