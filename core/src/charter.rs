//! Charter review: local format checks combined with AI validation,
//! suggestion generation and suggestion application.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::agents::CompletionOptions;
use crate::model_manager::{AiStatus, ModelManager, ProviderStatus};
use crate::parser::{self, Parsed, ValidationIssue};
use crate::prompts::PromptOperation;

const DESCRIPTION_PREVIEW_CHARS: usize = 500;
const MIN_PLAIN_TEXT_CHARS: usize = 50;

/// The charter layout every validation is measured against.
pub fn expected_format() -> Value {
    json!({
        "name": "string",
        "description": "string",
        "vision": "string",
        "problem_being_solved": "string",
        "scope": {
            "inside_scope": ["feature_1", "feature_2"],
            "outside_scope": ["feature_3"]
        },
        "modules": {
            "module_1": ["feature_1", "feature_2"],
            "module_2": ["feature_3"]
        },
        "risks": [
            {
                "risk_name": "string",
                "risk_impact": "string",
                "risk_mitigation": "string"
            }
        ],
        "roadmap": [
            {
                "starting_date": "2025-06-01",
                "end_date": "2025-06-30",
                "release_scope": ["module_1"]
            }
        ],
        "considerations": ["consideration_1"],
        "technical_considerations": ["tech_consideration_1"]
    })
}

/// A JSON object when `text` holds one, otherwise a minimal charter wrapping the text.
pub fn parse_charter_text(text: &str) -> Value {
    let trimmed = text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({
            "name": "Project Charter",
            "description": trimmed.chars().take(DESCRIPTION_PREVIEW_CHARS).collect::<String>(),
            "raw_input": trimmed,
        }),
    }
}

/// JSON truthiness: null, false, 0, "" and empty containers count as empty.
fn is_filled(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

pub fn validate_charter_format(charter: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    for field in ["name", "description"] {
        if !is_filled(charter.get(field)) {
            errors.push(format!("Missing required field: {field}"));
        }
    }
    let shape_checks: [(&str, fn(&Value) -> bool, &str); 4] = [
        ("scope", Value::is_object, "Scope must be an object with inside_scope and outside_scope arrays"),
        ("modules", Value::is_object, "Modules must be an object mapping module names to feature arrays"),
        ("risks", Value::is_array, "Risks must be an array of risk objects"),
        ("roadmap", Value::is_array, "Roadmap must be an array of release objects"),
    ];
    for (field, check, message) in shape_checks {
        if charter.get(field).is_some_and(|v| !check(v)) {
            errors.push(message.to_string());
        }
    }
    errors
}

/// Fraction of the expected sections present and non-empty.
pub fn completeness_score(charter: &Value) -> f64 {
    let expected = expected_format();
    let Some(sections) = expected.as_object() else {
        return 0.0;
    };
    let filled = sections
        .keys()
        .filter(|key| is_filled(charter.get(key.as_str())))
        .count();
    filled as f64 / sections.len() as f64
}

/// Local checks used when no model is available.
pub fn heuristic_issues(charter_text: &str) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    match serde_json::from_str::<Value>(charter_text.trim()) {
        Ok(charter @ Value::Object(_)) => {
            if !is_filled(charter.get("name")) {
                issues.push(ValidationIssue::new(
                    "name",
                    "Project name is missing",
                    "Add a clear, descriptive project name",
                    "high",
                ));
            }
            if !is_filled(charter.get("vision")) {
                issues.push(ValidationIssue::new(
                    "vision",
                    "Project vision is not defined",
                    "Add a vision statement describing the desired future state",
                    "medium",
                ));
            }
            if !is_filled(charter.get("risks")) {
                issues.push(ValidationIssue::new(
                    "risks",
                    "Risk assessment is missing",
                    "Identify potential risks and mitigation strategies",
                    "medium",
                ));
            }
        }
        _ => {
            if charter_text.trim().chars().count() < MIN_PLAIN_TEXT_CHARS {
                issues.push(ValidationIssue::new(
                    "description",
                    "Project description is too brief",
                    "Provide more detailed project description including scope, objectives, and expected outcomes",
                    "medium",
                ));
            }
        }
    }
    issues
}

/// Result of the lightweight `/projects/validate-charter` check.
#[derive(Debug, Clone, Serialize)]
pub struct HeuristicValidation {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub improved_charter: Option<Value>,
}

pub fn heuristic_validation(charter_text: &str) -> HeuristicValidation {
    let issues = heuristic_issues(charter_text);
    HeuristicValidation {
        is_valid: issues.is_empty(),
        issues,
        improved_charter: None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CharterValidationReport {
    pub is_valid: bool,
    pub completeness_score: f64,
    pub issues: Vec<ValidationIssue>,
    pub structured_charter: Option<Value>,
    pub format_errors: Vec<String>,
    pub ai_status: AiStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestionReport {
    pub suggestions: Vec<ValidationIssue>,
    pub ai_status: AiStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationReport {
    pub updated_charter: Value,
    pub applied_suggestions: Vec<String>,
    pub conflicts: Vec<String>,
    pub ai_status: AiStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CharterFormat {
    pub example: Value,
    pub description: String,
}

pub fn charter_format() -> CharterFormat {
    CharterFormat {
        example: expected_format(),
        description: "Expected project charter JSON structure with all supported fields and their formats."
            .to_string(),
    }
}

fn pretty(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

#[derive(Clone)]
pub struct CharterService {
    models: Arc<ModelManager>,
}

impl CharterService {
    pub fn new(models: Arc<ModelManager>) -> Self {
        Self { models }
    }

    pub fn provider_status(&self) -> ProviderStatus {
        self.models.status()
    }

    pub async fn probe_provider(&self) -> ProviderStatus {
        self.models.probe().await
    }

    /// Full validation. Always produces a report; AI problems only change `ai_status`.
    pub async fn validate(&self, charter_text: &str) -> CharterValidationReport {
        let parsed = parse_charter_text(charter_text);
        let format_errors = validate_charter_format(&parsed);

        let vars = HashMap::from([
            ("charter_text", charter_text.to_string()),
            ("expected_format", pretty(&expected_format())),
        ]);
        let options = CompletionOptions {
            temperature: 0.1,
            ..CompletionOptions::default()
        };
        let (ai, ai_status) = match self
            .models
            .invoke(PromptOperation::CharterValidation, &vars, options)
            .await
        {
            Ok(completion) => {
                let parsed_ai = parser::parse_validation(&completion.content);
                let status = self.note_fallback(PromptOperation::CharterValidation, &parsed_ai).await;
                (parsed_ai.value, status)
            }
            Err(_) => {
                let issues = heuristic_issues(charter_text);
                let fallback = parser::CharterValidation {
                    is_valid: issues.is_empty(),
                    issues,
                    structured_charter: None,
                    completeness_score: 0.0,
                };
                (fallback, AiStatus::Unavailable)
            }
        };

        let structured = ai.structured_charter.unwrap_or(parsed);
        let local_score = completeness_score(&structured);
        CharterValidationReport {
            is_valid: ai.is_valid && format_errors.is_empty(),
            completeness_score: ai.completeness_score.max(local_score),
            issues: ai.issues,
            structured_charter: Some(structured),
            format_errors,
            ai_status,
        }
    }

    pub async fn generate_suggestions(
        &self,
        charter: &Value,
        existing_issues: &[ValidationIssue],
    ) -> SuggestionReport {
        let vars = HashMap::from([
            ("charter", pretty(charter)),
            ("existing_issues", pretty(&existing_issues)),
        ]);
        let options = CompletionOptions {
            temperature: 0.2,
            ..CompletionOptions::default()
        };
        match self
            .models
            .invoke(PromptOperation::SuggestionGeneration, &vars, options)
            .await
        {
            Ok(completion) => {
                let parsed = parser::parse_suggestions(&completion.content);
                let ai_status = self.note_fallback(PromptOperation::SuggestionGeneration, &parsed).await;
                SuggestionReport {
                    suggestions: parsed.value,
                    ai_status,
                }
            }
            Err(_) => {
                // Offer the local findings the caller does not already have.
                let suggestions = heuristic_issues(&charter.to_string())
                    .into_iter()
                    .filter(|s| !existing_issues.iter().any(|e| e.field == s.field))
                    .collect();
                SuggestionReport {
                    suggestions,
                    ai_status: AiStatus::Unavailable,
                }
            }
        }
    }

    pub async fn apply_suggestions(
        &self,
        charter: &Value,
        accepted: &[ValidationIssue],
    ) -> ApplicationReport {
        if accepted.is_empty() {
            return ApplicationReport {
                updated_charter: charter.clone(),
                applied_suggestions: Vec::new(),
                conflicts: Vec::new(),
                ai_status: AiStatus::Ok,
            };
        }
        let vars = HashMap::from([
            ("charter", pretty(charter)),
            ("suggestions", pretty(&accepted)),
        ]);
        let options = CompletionOptions {
            temperature: 0.1,
            max_tokens: 3000,
        };
        match self
            .models
            .invoke(PromptOperation::SuggestionApplication, &vars, options)
            .await
        {
            Ok(completion) => {
                let parsed = parser::parse_application(&completion.content, charter);
                let ai_status = self.note_fallback(PromptOperation::SuggestionApplication, &parsed).await;
                ApplicationReport {
                    updated_charter: parsed.value.updated_charter,
                    applied_suggestions: parsed.value.applied_suggestions,
                    conflicts: parsed.value.conflicts,
                    ai_status,
                }
            }
            Err(_) => ApplicationReport {
                updated_charter: charter.clone(),
                applied_suggestions: Vec::new(),
                conflicts: Vec::new(),
                ai_status: AiStatus::Unavailable,
            },
        }
    }

    async fn note_fallback<T>(&self, operation: PromptOperation, parsed: &Parsed<T>) -> AiStatus {
        note_fallback(&self.models, operation, parsed).await
    }
}

/// Logs a parser fallback and maps it to the client-facing status.
pub(crate) async fn note_fallback<T>(
    models: &ModelManager,
    operation: PromptOperation,
    parsed: &Parsed<T>,
) -> AiStatus {
    if !parsed.fell_back {
        return AiStatus::Ok;
    }
    let reason = parsed.reason.clone().unwrap_or_default();
    log::warn!("{} response unparseable, using defaults: {reason}", operation.as_str());
    models
        .record(
            "warn",
            "AI-0300",
            "AI response unparseable; default result used",
            json!({ "operation": operation.as_str(), "reason": reason }),
        )
        .await;
    AiStatus::Unparseable
}

/// Builds charter text for a project that has no stored charter.
pub fn charter_from_fields(
    name: &str,
    description: Option<&str>,
    vision: Option<&str>,
    problem: Option<&str>,
) -> Value {
    let mut charter = Map::new();
    charter.insert("name".to_string(), Value::String(name.to_string()));
    for (key, value) in [
        ("description", description),
        ("vision", vision),
        ("problem_being_solved", problem),
    ] {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            charter.insert(key.to_string(), Value::String(v.to_string()));
        }
    }
    Value::Object(charter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AiProvider, Backend, ProviderKind};
    use crate::config::Settings;
    use crate::db::{init_db, DatabaseTarget};
    use crate::prompts::PromptManager;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prompts() -> Arc<PromptManager> {
        Arc::new(PromptManager::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../prompts"
        )))
    }

    fn offline_service() -> CharterService {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        CharterService::new(ModelManager::from_settings(pool, &Settings::default(), prompts()))
    }

    async fn service_replying(body: &str) -> (CharterService, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": body } }]
            })))
            .mount(&server)
            .await;
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let backend = Backend::new("k", "gpt-4", server.uri(), Duration::from_secs(5)).unwrap();
        let models = ModelManager::new(
            pool,
            Ok(AiProvider::with_backend(ProviderKind::OpenAi, backend)),
            prompts(),
        );
        (CharterService::new(models), server)
    }

    #[test]
    fn plain_text_is_wrapped() {
        let charter = parse_charter_text("  A tool that plans things.  ");
        assert_eq!(charter["name"], "Project Charter");
        assert_eq!(charter["raw_input"], "A tool that plans things.");
    }

    #[test]
    fn format_errors_cover_required_fields_and_shapes() {
        let errors = validate_charter_format(&json!({
            "name": "X",
            "scope": ["not", "an", "object"],
            "risks": {}
        }));
        assert_eq!(
            errors,
            vec![
                "Missing required field: description".to_string(),
                "Scope must be an object with inside_scope and outside_scope arrays".to_string(),
                "Risks must be an array of risk objects".to_string(),
            ]
        );
    }

    #[test]
    fn completeness_counts_non_empty_sections() {
        let score = completeness_score(&json!({
            "name": "X",
            "description": "",
            "vision": "Better planning",
            "risks": []
        }));
        assert!((score - 2.0 / 10.0).abs() < 1e-9);
        assert_eq!(completeness_score(&expected_format()), 1.0);
    }

    #[test]
    fn heuristics_flag_short_text_and_missing_sections() {
        let short = heuristic_validation("too short");
        assert!(!short.is_valid);
        assert_eq!(short.issues[0].field, "description");

        let json_issues = heuristic_issues(r#"{"name": "X"}"#);
        let fields: Vec<_> = json_issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["vision", "risks"]);
    }

    #[tokio::test]
    async fn validation_without_provider_uses_heuristics() {
        let report = offline_service().validate(r#"{"name": "x"}"#).await;
        assert_eq!(report.ai_status, AiStatus::Unavailable);
        assert!(!report.is_valid);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.format_errors, vec!["Missing required field: description".to_string()]);
        assert_eq!(report.structured_charter, Some(json!({ "name": "x" })));
    }

    #[tokio::test]
    async fn validation_merges_ai_and_local_results() {
        let reply = r#"```json
{"is_valid": true, "completeness_score": 0.1, "issues": [],
 "structured_charter": {"name": "Atlas", "description": "Planning", "vision": "v"}}
```"#;
        let (service, _server) = service_replying(reply).await;
        let report = service.validate("Atlas is a planning tool").await;
        assert_eq!(report.ai_status, AiStatus::Ok);
        // Plain text yields a wrapped charter with name and description present.
        assert!(report.is_valid);
        assert!((report.completeness_score - 3.0 / 10.0).abs() < 1e-9);
        assert_eq!(report.structured_charter.unwrap()["name"], "Atlas");
    }

    #[tokio::test]
    async fn garbage_reply_is_unparseable() {
        let (service, _server) = service_replying("I am not able to help with that.").await;
        let report = service.validate(r#"{"name": "x", "description": "y"}"#).await;
        assert_eq!(report.ai_status, AiStatus::Unparseable);
        assert!(!report.is_valid);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn suggestions_skip_existing_fields_when_offline() {
        let existing = vec![ValidationIssue::new("vision", "missing", "add", "medium")];
        let report = offline_service()
            .generate_suggestions(&json!({ "name": "x" }), &existing)
            .await;
        assert_eq!(report.ai_status, AiStatus::Unavailable);
        let fields: Vec<_> = report.suggestions.iter().map(|s| s.field.as_str()).collect();
        assert_eq!(fields, vec!["risks"]);
    }

    #[tokio::test]
    async fn application_returns_updated_charter() {
        let reply = r#"{"updated_charter": {"name": "x", "vision": "Clear"}, "applied_suggestions": ["added vision"], "conflicts": []}"#;
        let (service, _server) = service_replying(reply).await;
        let accepted = vec![ValidationIssue::new("vision", "missing", "add", "medium")];
        let report = service.apply_suggestions(&json!({ "name": "x" }), &accepted).await;
        assert_eq!(report.ai_status, AiStatus::Ok);
        assert_eq!(report.updated_charter["vision"], "Clear");
        assert_eq!(report.applied_suggestions, vec!["added vision".to_string()]);
    }

    #[test]
    fn charter_from_fields_skips_blanks() {
        let charter = charter_from_fields("Atlas", Some("desc"), Some("  "), None);
        assert_eq!(charter, json!({ "name": "Atlas", "description": "desc" }));
    }
}
