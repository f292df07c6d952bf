//! HTTP surface served by axum.
//!
//! Versioned modules (currently `v1`) group the routes under `/api/<version>`.
//! Handlers stay thin: they decode input, run repository calls on the blocking
//! pool and map [`PlanFlowError`] into `{detail, code}` responses.

pub mod v1;

use std::sync::Arc;
use std::time::Instant;

use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use crate::charter::CharterService;
use crate::config::Settings;
use crate::db::DbPool;
use crate::errors::{PlanFlowError, PlanFlowResult};
use crate::logging::{list_events, EventRecord};
use crate::model_manager::ModelManager;
use crate::prompts::PromptManager;
use crate::release_planner::ReleasePlanner;
use crate::workers::{transport_from_settings, JobTransport};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub models: Arc<ModelManager>,
    pub charter: CharterService,
    pub planner: ReleasePlanner,
    pub queue: Arc<dyn JobTransport>,
    pub settings: Arc<Settings>,
}

impl ApiState {
    pub fn new(
        db: DbPool,
        models: Arc<ModelManager>,
        queue: Arc<dyn JobTransport>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            charter: CharterService::new(models.clone()),
            planner: ReleasePlanner::new(models.clone()),
            models,
            queue,
            settings: Arc::new(settings),
        }
    }

    /// Wires the provider, prompt store and job transport described by `settings`.
    pub fn from_settings(db: DbPool, settings: Settings) -> PlanFlowResult<Self> {
        let prompts = Arc::new(PromptManager::new(settings.prompts_dir.clone()));
        let models = ModelManager::from_settings(db.clone(), &settings, prompts);
        let queue = transport_from_settings(&settings, db.clone())?;
        Ok(Self::new(db, models, queue, settings))
    }

    /// Runs `f` with a pooled connection on the blocking thread pool.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Connection) -> PlanFlowResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.db.clone();
        let result = spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(PlanFlowError::from)??;
        Ok(result)
    }
}

/// Error body shared by every route: `{"detail": ..., "code": ...}`.
#[derive(Debug)]
pub struct ApiError(pub PlanFlowError);

impl From<PlanFlowError> for ApiError {
    fn from(err: PlanFlowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PlanFlowError::NotFound(_) => StatusCode::NOT_FOUND,
            PlanFlowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PlanFlowError::BadRequest(_) | PlanFlowError::CharterMissing => StatusCode::BAD_REQUEST,
            PlanFlowError::Conflict(_) => StatusCode::CONFLICT,
            PlanFlowError::DbUnavailable(_)
            | PlanFlowError::Database(_)
            | PlanFlowError::Queue(_)
            | PlanFlowError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{} {}: {}", self.0.code(), self.0.explain(), self.0);
        }
        let body = Json(json!({ "detail": self.0.to_string(), "code": self.0.code() }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// `Json` extractor whose rejections use the `{detail, code}` body.
///
/// Well-formed JSON of the wrong shape is a 422; anything unreadable is a 400.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::JsonDataError(err)) => {
                Err(PlanFlowError::Validation(err.body_text()).into())
            }
            Err(rejection) => Err(PlanFlowError::BadRequest(rejection.body_text()).into()),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", v1::routes())
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(middleware::from_fn(request_log))
        .with_state(state)
}

async fn root(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "message": state.settings.app_name,
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.settings.environment,
        "docs": "/api/v1",
    }))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let database = state.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |_| Ok(()))?)).await;
    Json(json!({
        "status": if database.is_ok() { "healthy" } else { "degraded" },
        "database": database.is_ok(),
        "ai": state.models.is_available(),
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub module: Option<String>,
    pub limit: Option<u32>,
}

pub(crate) async fn events(
    State(state): State<ApiState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state
        .with_conn(move |conn| Ok(list_events(conn, query.module.as_deref(), limit)?))
        .await?;
    Ok(Json(events))
}

fn allowed_origin(settings: &Settings, req: &Request) -> Option<HeaderValue> {
    let origin = req.headers().get(header::ORIGIN)?;
    let raw = origin.to_str().ok()?;
    settings
        .backend_cors_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed == raw)
        .then(|| origin.clone())
}

fn apply_cors(response: &mut Response, origin: HeaderValue) {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("origin"));
}

/// Answers preflight requests and tags responses for configured origins.
async fn cors(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let origin = allowed_origin(&state.settings, &req);

    if req.method() == Method::OPTIONS {
        if let Some(origin) = origin {
            let mut response = StatusCode::NO_CONTENT.into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
            );
            let requested = req
                .headers()
                .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("*"));
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
            apply_cors(&mut response, origin);
            return response;
        }
    }

    let mut response = next.run(req).await;
    if let Some(origin) = origin {
        apply_cors(&mut response, origin);
    }
    response
}

async fn request_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    log::info!(
        "{method} {path} -> {} in {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}
