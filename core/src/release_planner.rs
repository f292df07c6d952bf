//! Derives a release plan from a project charter and turns selected entries
//! into stored releases.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::CompletionOptions;
use crate::charter::note_fallback;
use crate::errors::{PlanFlowError, PlanFlowResult};
use crate::model_manager::{AiStatus, ModelManager};
use crate::models::parse_date;
use crate::models::projects::Project;
use crate::models::releases::{create_release, Release, ReleaseCreate};
use crate::parser::{self, ExtractedRelease, ReleasePlan};
use crate::prompts::PromptOperation;

const EXTRACTION_MAX_TOKENS: u32 = 4000;

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseExtraction {
    #[serde(flatten)]
    pub plan: ReleasePlan,
    pub success: bool,
    pub message: Option<String>,
    pub ai_status: AiStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFromExtraction {
    pub selected_releases: Vec<i64>,
    pub extracted_data: ReleasePlan,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedRelease {
    pub index: i64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkReleaseCreation {
    pub created_releases: Vec<Release>,
    pub failed_releases: Vec<FailedRelease>,
    pub success_count: usize,
    pub total_count: usize,
}

/// The charter stored on a project, if it holds anything.
pub fn project_charter(project: &Project) -> Option<&Value> {
    project.charter.as_ref().filter(|charter| match charter {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    })
}

#[derive(Clone)]
pub struct ReleasePlanner {
    models: Arc<ModelManager>,
}

impl ReleasePlanner {
    pub fn new(models: Arc<ModelManager>) -> Self {
        Self { models }
    }

    /// Ask the model for a release plan. Fails only when the project has no charter.
    pub async fn extract(&self, project: &Project) -> PlanFlowResult<ReleaseExtraction> {
        let charter = project_charter(project).ok_or(PlanFlowError::CharterMissing)?;
        let vars = HashMap::from([(
            "charter_data",
            serde_json::to_string_pretty(charter).unwrap_or_else(|_| charter.to_string()),
        )]);
        let options = CompletionOptions {
            temperature: 0.1,
            max_tokens: EXTRACTION_MAX_TOKENS,
        };

        match self
            .models
            .invoke(PromptOperation::ReleaseExtraction, &vars, options)
            .await
        {
            Ok(completion) => {
                let parsed = parser::parse_release_plan(&completion.content);
                let ai_status =
                    note_fallback(&self.models, PromptOperation::ReleaseExtraction, &parsed).await;
                let message = parsed
                    .reason
                    .clone()
                    .map(|reason| format!("AI response could not be parsed: {reason}"));
                Ok(ReleaseExtraction {
                    plan: parsed.value,
                    success: ai_status == AiStatus::Ok,
                    message,
                    ai_status,
                })
            }
            Err(err) => Ok(ReleaseExtraction {
                plan: ReleasePlan::default(),
                success: false,
                message: Some(err.to_string()),
                ai_status: AiStatus::Unavailable,
            }),
        }
    }
}

/// Drops dates the model produced in a format the database would reject.
fn usable_date(release: &ExtractedRelease, field: &str, raw: Option<&String>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match parse_date(field, raw) {
        Ok(_) => Some(raw.to_string()),
        Err(_) => {
            log::warn!("dropping invalid {field} '{raw}' for extracted release '{}'", release.name);
            None
        }
    }
}

/// Creates the releases at `selected` indices of `plan`, collecting per-index failures.
pub fn create_from_extraction(
    conn: &Connection,
    project_id: i64,
    plan: &ReleasePlan,
    selected: &[i64],
) -> BulkReleaseCreation {
    let mut created = Vec::new();
    let mut failed = Vec::new();

    for &index in selected {
        let Some(extracted) = usize::try_from(index)
            .ok()
            .and_then(|i| plan.extracted_releases.get(i))
        else {
            failed.push(FailedRelease {
                index,
                error: "Release index out of range".to_string(),
            });
            continue;
        };

        let input = ReleaseCreate {
            name: extracted.name.clone(),
            description: Some(extracted.description.clone()).filter(|d| !d.is_empty()),
            version: extracted.version.clone(),
            start_date: usable_date(extracted, "start_date", extracted.start_date.as_ref()),
            end_date: usable_date(extracted, "end_date", extracted.end_date.as_ref()),
            scope_modules: extracted.scope_modules.clone(),
            goals: extracted.goals.clone(),
        };
        match create_release(conn, project_id, &input) {
            Ok(release) => created.push(release),
            Err(err) => {
                log::error!("failed to create extracted release {index}: {err}");
                failed.push(FailedRelease {
                    index,
                    error: err.to_string(),
                });
            }
        }
    }

    BulkReleaseCreation {
        success_count: created.len(),
        total_count: selected.len(),
        created_releases: created,
        failed_releases: failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::{init_db, DatabaseTarget, DEMO_USER_ID};
    use crate::models::projects::{create_project, ProjectCreate};
    use crate::prompts::PromptManager;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn plan() -> ReleasePlan {
        serde_json::from_value(json!({
            "extracted_releases": [
                { "name": "MVP", "description": "core", "start_date": "2025-06-01", "end_date": "2025-06-30" },
                { "name": "Beta", "description": "more", "start_date": "June 2025" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn creates_selected_and_reports_out_of_range() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let conn = pool.get().unwrap();
        let project = create_project(
            &conn,
            DEMO_USER_ID,
            &ProjectCreate {
                name: "Plan".to_string(),
                ..ProjectCreate::default()
            },
        )
        .unwrap();

        let result = create_from_extraction(&conn, project.id, &plan(), &[0, 1, 5, -1]);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.total_count, 4);
        assert_eq!(
            result.failed_releases.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![5, -1]
        );
        // The unparseable date is dropped rather than failing the release.
        assert_eq!(result.created_releases[1].start_date, None);
        assert_eq!(
            result.created_releases[0].end_date.as_deref(),
            Some("2025-06-30")
        );
    }

    #[tokio::test]
    async fn extraction_requires_a_charter() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let project = {
            let conn = pool.get().unwrap();
            create_project(
                &conn,
                DEMO_USER_ID,
                &ProjectCreate {
                    name: "No charter".to_string(),
                    charter: Some(json!({})),
                    ..ProjectCreate::default()
                },
            )
            .unwrap()
        };
        let prompts = Arc::new(PromptManager::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../prompts"
        )));
        let planner = ReleasePlanner::new(ModelManager::from_settings(
            pool,
            &Settings::default(),
            prompts,
        ));
        assert!(matches!(
            planner.extract(&project).await,
            Err(PlanFlowError::CharterMissing)
        ));

        let mut with_charter = project.clone();
        with_charter.charter = Some(json!({ "name": "Plan" }));
        let extraction = planner.extract(&with_charter).await.unwrap();
        assert_eq!(extraction.ai_status, AiStatus::Unavailable);
        assert!(!extraction.success);
        assert!(extraction.plan.extracted_releases.is_empty());
    }
}
