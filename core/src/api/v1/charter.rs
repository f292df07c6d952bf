use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{ApiJson, ApiState};
use crate::charter::{
    charter_format, ApplicationReport, CharterFormat, CharterValidationReport, SuggestionReport,
};
use crate::model_manager::ProviderStatus;
use crate::parser::ValidationIssue;
use crate::prompts::PromptOperation;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/validate", post(validate))
        .route("/suggestions", post(suggestions))
        .route("/apply-suggestions", post(apply_suggestions))
        .route("/status", get(status))
        .route("/format", get(format))
        .route("/prompts", get(prompts))
        .route("/prompts/reload", post(reload_prompts))
}

/// Either `{"charter_text": "..."}` or the charter object itself. The wrapper
/// form only applies when `charter_text` is the sole key.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct ValidateBody(Map<String, Value>);

impl ValidateBody {
    fn into_text(self) -> String {
        let map = self.0;
        match map.get("charter_text") {
            Some(Value::String(text)) if map.len() == 1 => text.clone(),
            _ => Value::Object(map).to_string(),
        }
    }
}

async fn validate(
    State(state): State<ApiState>,
    ApiJson(body): ApiJson<ValidateBody>,
) -> Json<CharterValidationReport> {
    let text = body.into_text();
    log::info!("validating charter with {} characters", text.len());
    Json(state.charter.validate(&text).await)
}

#[derive(Debug, Deserialize)]
struct SuggestionRequest {
    charter: Value,
    #[serde(default)]
    existing_issues: Vec<ValidationIssue>,
}

async fn suggestions(
    State(state): State<ApiState>,
    ApiJson(body): ApiJson<SuggestionRequest>,
) -> Json<SuggestionReport> {
    Json(
        state
            .charter
            .generate_suggestions(&body.charter, &body.existing_issues)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct ApplicationRequest {
    charter: Value,
    accepted_suggestions: Vec<ValidationIssue>,
}

async fn apply_suggestions(
    State(state): State<ApiState>,
    ApiJson(body): ApiJson<ApplicationRequest>,
) -> Json<ApplicationReport> {
    Json(
        state
            .charter
            .apply_suggestions(&body.charter, &body.accepted_suggestions)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    probe: bool,
}

/// Configuration status; `?probe=true` also sends a tiny live request.
async fn status(State(state): State<ApiState>, Query(query): Query<StatusQuery>) -> Json<ProviderStatus> {
    if query.probe {
        Json(state.charter.probe_provider().await)
    } else {
        Json(state.charter.provider_status())
    }
}

async fn format() -> Json<CharterFormat> {
    Json(charter_format())
}

#[derive(Debug, Serialize)]
struct PromptVersions {
    operation: &'static str,
    versions: Vec<String>,
}

/// Template versions available on disk for each operation, newest first.
async fn prompts(State(state): State<ApiState>) -> Json<Vec<PromptVersions>> {
    let store = state.models.prompts();
    Json(
        PromptOperation::ALL
            .into_iter()
            .map(|operation| PromptVersions {
                operation: operation.as_str(),
                versions: store.list_versions(operation),
            })
            .collect(),
    )
}

/// Drops cached templates so edited files are picked up.
async fn reload_prompts(State(state): State<ApiState>) -> Json<Value> {
    state.models.prompts().clear_cache();
    log::info!("prompt cache cleared");
    Json(serde_json::json!({ "message": "Prompt cache cleared" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> ValidateBody {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn wrapped_text_is_unwrapped() {
        let text = body(json!({ "charter_text": "Atlas maps things" })).into_text();
        assert_eq!(text, "Atlas maps things");
    }

    #[test]
    fn charter_object_keeps_every_field() {
        let text = body(json!({
            "name": "Atlas",
            "charter_text": "legacy notes",
            "vision": "Plan better"
        }))
        .into_text();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["name"], "Atlas");
        assert_eq!(parsed["vision"], "Plan better");
        assert_eq!(parsed["charter_text"], "legacy notes");
    }

    #[test]
    fn non_string_charter_text_is_treated_as_charter() {
        let text = body(json!({ "charter_text": 42 })).into_text();
        assert_eq!(text, r#"{"charter_text":42}"#);
    }
}
