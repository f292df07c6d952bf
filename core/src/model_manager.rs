//! Renders prompt templates, sends them to the configured provider and
//! records every invocation in the event log.
//!
//! Higher level services (charter review, release planning, workers) ask the
//! manager for a completion by operation name and never deal with provider
//! selection or prompt files themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::spawn_blocking;

use crate::agents::{AiProvider, Completion, CompletionOptions, ProviderError, ProviderKind};
use crate::config::Settings;
use crate::db::DbPool;
use crate::logging::log_event_pooled;
use crate::prompts::{PromptError, PromptManager, PromptOperation};

/// Outcome of the AI part of a response, surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AiStatus {
    Ok,
    Unavailable,
    Unparseable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub model: String,
    pub available: bool,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub struct ModelManager {
    pool: DbPool,
    provider: Result<AiProvider, ProviderError>,
    prompts: Arc<PromptManager>,
    configured_kind: Option<ProviderKind>,
    configured_model: String,
}

impl ModelManager {
    pub fn new(
        pool: DbPool,
        provider: Result<AiProvider, ProviderError>,
        prompts: Arc<PromptManager>,
    ) -> Arc<Self> {
        let (configured_kind, configured_model) = match &provider {
            Ok(p) => (Some(p.kind()), p.model().to_string()),
            Err(_) => (None, String::new()),
        };
        Arc::new(Self {
            pool,
            provider,
            prompts,
            configured_kind,
            configured_model,
        })
    }

    /// Build the provider from settings. A missing key leaves the manager in
    /// the unavailable state rather than failing startup.
    pub fn from_settings(pool: DbPool, settings: &Settings, prompts: Arc<PromptManager>) -> Arc<Self> {
        let provider = AiProvider::from_settings(settings);
        if let Err(err) = &provider {
            log::warn!("AI provider unavailable: {err}");
        }
        let configured_kind = ProviderKind::parse(&settings.ai_provider);
        let configured_model = settings
            .ai_model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| configured_kind.map(|k| k.default_model().to_string()))
            .unwrap_or_default();
        Arc::new(Self {
            pool,
            provider,
            prompts,
            configured_kind,
            configured_model,
        })
    }

    pub fn prompts(&self) -> &PromptManager {
        &self.prompts
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_ok()
    }

    pub fn status(&self) -> ProviderStatus {
        ProviderStatus {
            provider: self
                .configured_kind
                .map(|k| k.id().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            model: self.configured_model.clone(),
            available: self.provider.is_ok(),
            error: self.provider.as_ref().err().map(|e| e.to_string()),
        }
    }

    /// Status plus a minimal live request against the provider.
    pub async fn probe(&self) -> ProviderStatus {
        let mut status = self.status();
        if let Ok(provider) = &self.provider {
            let options = CompletionOptions {
                temperature: 0.0,
                max_tokens: 10,
            };
            if let Err(err) = provider
                .complete(
                    "You are a test assistant. Respond with exactly 'OK'.",
                    "Test connection - respond with 'OK'",
                    options,
                )
                .await
            {
                status.available = false;
                status.error = Some(err.to_string());
            }
        }
        status
    }

    /// Render the template for `operation` and run it through the provider.
    pub async fn invoke(
        &self,
        operation: PromptOperation,
        vars: &HashMap<&str, String>,
        options: CompletionOptions,
    ) -> Result<Completion, InvocationError> {
        let prompt = match self.prompts.render(operation, vars) {
            Ok(prompt) => prompt,
            Err(err) => {
                log::error!("prompt for {} failed to render: {err}", operation.as_str());
                self.record(
                    "error",
                    err.code(),
                    "prompt template could not be rendered",
                    serde_json::json!({
                        "operation": operation.as_str(),
                        "error": err.to_string(),
                    }),
                )
                .await;
                return Err(err.into());
            }
        };

        let provider = self.provider.as_ref().map_err(Clone::clone)?;
        let digest = prompt_digest(&prompt.system, &prompt.user);
        let started = Instant::now();
        let result = provider.complete(&prompt.system, &prompt.user, options).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(completion) => {
                log::info!(
                    "{} completed via {} ({}) in {latency_ms}ms",
                    operation.as_str(),
                    provider.kind().id(),
                    completion.model
                );
                self.record(
                    "info",
                    "AI-0200",
                    "AI invocation succeeded",
                    serde_json::json!({
                        "operation": operation.as_str(),
                        "prompt_version": prompt.version,
                        "prompt_sha256": digest,
                        "provider": provider.kind().id(),
                        "model": completion.model,
                        "latency_ms": latency_ms,
                        "usage": completion.usage,
                    }),
                )
                .await;
            }
            Err(err) => {
                log::warn!("{} failed via {}: {err}", operation.as_str(), provider.kind().id());
                self.record(
                    "warn",
                    err.code(),
                    "AI invocation failed",
                    serde_json::json!({
                        "operation": operation.as_str(),
                        "prompt_version": prompt.version,
                        "prompt_sha256": digest,
                        "provider": provider.kind().id(),
                        "model": provider.model(),
                        "latency_ms": latency_ms,
                        "error": err.to_string(),
                    }),
                )
                .await;
            }
        }

        Ok(result?)
    }

    /// Persist an `ai.runtime` event without blocking the async executor.
    pub async fn record(&self, level: &str, code: &str, message: &str, data: serde_json::Value) {
        let pool = self.pool.clone();
        let level = level.to_string();
        let code = code.to_string();
        let message = message.to_string();
        let _ = spawn_blocking(move || {
            log_event_pooled(&pool, &level, Some(&code), "ai.runtime", &message, Some(data));
        })
        .await;
    }
}

fn prompt_digest(system: &str, user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    hasher.update([0u8]);
    hasher.update(user.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Backend;
    use crate::db::{init_db, DatabaseTarget};
    use crate::logging::list_events;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prompts() -> Arc<PromptManager> {
        Arc::new(PromptManager::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../prompts"
        )))
    }

    fn vars() -> HashMap<&'static str, String> {
        HashMap::from([("charter_data", "{\"name\": \"X\"}".to_string())])
    }

    #[tokio::test]
    async fn unavailable_provider_is_reported_without_calling_out() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let manager = ModelManager::from_settings(pool, &Settings::default(), prompts());
        let status = manager.status();
        assert_eq!(status.provider, "openai");
        assert_eq!(status.model, "gpt-4");
        assert!(!status.available);

        let err = manager
            .invoke(PromptOperation::ReleaseExtraction, &vars(), CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::Provider(ProviderError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn successful_invocation_is_logged_with_digest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "{\"extracted_releases\": []}" } }]
            })))
            .mount(&server)
            .await;

        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let backend =
            Backend::new("k", "gpt-4", server.uri(), Duration::from_secs(5)).unwrap();
        let manager = ModelManager::new(
            pool.clone(),
            Ok(AiProvider::with_backend(ProviderKind::OpenAi, backend)),
            prompts(),
        );
        let completion = manager
            .invoke(PromptOperation::ReleaseExtraction, &vars(), CompletionOptions::default())
            .await
            .unwrap();
        assert!(completion.content.contains("extracted_releases"));

        let conn = pool.get().unwrap();
        let events = list_events(&conn, Some("ai.runtime"), 10).unwrap();
        assert_eq!(events.len(), 1);
        let data = events[0].data.clone().unwrap();
        assert_eq!(data["operation"], "release_extraction");
        assert_eq!(data["prompt_sha256"].as_str().map(str::len), Some(64));
    }

    #[tokio::test]
    async fn prompt_errors_are_logged_at_error_level() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let manager = ModelManager::from_settings(pool.clone(), &Settings::default(), prompts());
        let err = manager
            .invoke(
                PromptOperation::ReleaseExtraction,
                &HashMap::new(),
                CompletionOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Prompt(_)));
        let conn = pool.get().unwrap();
        let events = list_events(&conn, Some("ai.runtime"), 10).unwrap();
        assert_eq!(events[0].level, "error");
    }
}
