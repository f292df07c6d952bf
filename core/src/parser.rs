//! Pulls JSON out of free-form model output and maps it onto typed results.
//!
//! Models wrap JSON in markdown fences or chatter around it. The typed parsers
//! never fail: when nothing usable is found they return the empty default and
//! flag the fallback so callers can log it and surface `ai_status`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parse result that remembers whether the default was substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub fell_back: bool,
    pub reason: Option<String>,
}

impl<T> Parsed<T> {
    fn ok(value: T) -> Self {
        Self {
            value,
            fell_back: false,
            reason: None,
        }
    }

    fn fallback(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            fell_back: true,
            reason: Some(reason.into()),
        }
    }
}

fn default_severity() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default = "default_severity")]
    pub severity: String,
}

impl ValidationIssue {
    pub fn new(field: &str, issue: &str, suggestion: &str, severity: &str) -> Self {
        Self {
            field: field.to_string(),
            issue: issue.to_string(),
            suggestion: suggestion.to_string(),
            severity: severity.to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        self.issue.trim().is_empty() && self.suggestion.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharterValidation {
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub structured_charter: Option<Value>,
    #[serde(default)]
    pub completeness_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionApplication {
    pub updated_charter: Value,
    pub applied_suggestions: Vec<String>,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelease {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub scope_modules: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default = "default_release_status")]
    pub status: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub estimated_effort: Option<String>,
}

fn default_release_status() -> String {
    "Not Started".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_severity")]
    pub priority: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStrategy {
    #[serde(default)]
    pub total_releases: u32,
    #[serde(default)]
    pub overall_timeline: String,
    #[serde(default)]
    pub release_cadence: String,
    #[serde(default)]
    pub critical_path: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleasePlan {
    #[serde(default)]
    pub extracted_releases: Vec<ExtractedRelease>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub release_strategy: ReleaseStrategy,
}

/// Locate the JSON object embedded in `raw`.
///
/// Tries a ```` ```json ```` fence, then a bare fence whose body starts with
/// `{`, then every `{` in the text in order until one opens a parseable object.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + 7..];
        if let Some(end) = body.find("```") {
            if let Some(value) = parse_object(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    if let Some(start) = trimmed.find("```") {
        let body = &trimmed[start + 3..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if inner.starts_with('{') {
                if let Some(value) = parse_object(inner) {
                    return Some(value);
                }
            }
        }
    }

    for (idx, _) in trimmed.match_indices('{') {
        let candidate = &trimmed[idx..];
        // Stream parsing tolerates trailing prose after the object.
        let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            return Some(value);
        }
        if let Some(value) = balanced_object(candidate).and_then(parse_object) {
            return Some(value);
        }
    }

    None
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// The `{...}` prefix of `text` with balanced braces, ignoring braces in strings.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (idx, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_typed<T: DeserializeOwned>(raw: &str) -> Result<(T, Value), String> {
    let value = extract_json(raw).ok_or_else(|| "no JSON object found in response".to_string())?;
    let typed = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    Ok((typed, value))
}

pub fn parse_validation(raw: &str) -> Parsed<CharterValidation> {
    match extract_typed::<CharterValidation>(raw) {
        Ok((mut validation, _)) => {
            // A missing `is_valid` reads as false; the issues still count.
            validation.completeness_score = validation.completeness_score.clamp(0.0, 1.0);
            validation.issues.retain(|issue| !issue.is_blank());
            if !matches!(validation.structured_charter, Some(Value::Object(_))) {
                validation.structured_charter = None;
            }
            Parsed::ok(validation)
        }
        Err(reason) => Parsed::fallback(CharterValidation::default(), reason),
    }
}

pub fn parse_suggestions(raw: &str) -> Parsed<Vec<ValidationIssue>> {
    #[derive(Deserialize)]
    struct Envelope {
        suggestions: Vec<ValidationIssue>,
    }

    match extract_typed::<Envelope>(raw) {
        Ok((envelope, _)) => {
            let mut suggestions = envelope.suggestions;
            suggestions.retain(|s| !s.is_blank());
            Parsed::ok(suggestions)
        }
        Err(reason) => Parsed::fallback(Vec::new(), reason),
    }
}

pub fn parse_application(raw: &str, original: &Value) -> Parsed<SuggestionApplication> {
    #[derive(Deserialize)]
    struct Envelope {
        updated_charter: Value,
        #[serde(default)]
        applied_suggestions: Vec<String>,
        #[serde(default)]
        conflicts: Vec<String>,
    }

    let fallback = || SuggestionApplication {
        updated_charter: original.clone(),
        applied_suggestions: Vec::new(),
        conflicts: Vec::new(),
    };

    match extract_typed::<Envelope>(raw) {
        Ok((envelope, _)) if envelope.updated_charter.is_object() => {
            Parsed::ok(SuggestionApplication {
                updated_charter: envelope.updated_charter,
                applied_suggestions: envelope.applied_suggestions,
                conflicts: envelope.conflicts,
            })
        }
        Ok(_) => Parsed::fallback(fallback(), "updated_charter is not an object"),
        Err(reason) => Parsed::fallback(fallback(), reason),
    }
}

pub fn parse_release_plan(raw: &str) -> Parsed<ReleasePlan> {
    match extract_typed::<ReleasePlan>(raw) {
        Ok((mut plan, value)) => {
            if value.get("extracted_releases").is_none() {
                return Parsed::fallback(ReleasePlan::default(), "missing extracted_releases");
            }
            plan.extracted_releases.retain(|r| !r.name.trim().is_empty());
            if plan.release_strategy.total_releases == 0 {
                plan.release_strategy.total_releases = plan.extracted_releases.len() as u32;
            }
            Parsed::ok(plan)
        }
        Err(reason) => Parsed::fallback(ReleasePlan::default(), reason),
    }
}
