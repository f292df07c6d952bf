use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::providers::{ProviderKind, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::config::Settings;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Unsupported AI provider '{0}'")]
    Unsupported(String),
    #[error("{provider} API key is not configured (set {env})")]
    NotConfigured {
        provider: &'static str,
        env: &'static str,
    },
    #[error("{provider} request timed out")]
    Timeout { provider: &'static str },
    #[error("{provider} request failed: {message}")]
    Network {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} rate limit exceeded")]
    RateLimited { provider: &'static str },
    #[error("{provider} rejected the API key")]
    InvalidApiKey { provider: &'static str },
    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} returned a malformed response: {reason}")]
    MalformedResponse {
        provider: &'static str,
        reason: String,
    },
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "AI-1000",
            Self::NotConfigured { .. } => "AI-1001",
            Self::Timeout { .. } => "AI-1002",
            Self::Network { .. } => "AI-1003",
            Self::RateLimited { .. } => "AI-1004",
            Self::InvalidApiKey { .. } => "AI-1005",
            Self::Http { .. } => "AI-1006",
            Self::MalformedResponse { .. } => "AI-1007",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageMetrics {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub provider: ProviderKind,
    pub usage: Option<UsageMetrics>,
}

/// Connection details shared by both backends.
#[derive(Debug, Clone)]
pub struct Backend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl Backend {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("PlanFlow-Core/0.1")
            .build()
            .map_err(|err| ProviderError::Network {
                provider: "http",
                message: format!("failed to construct HTTP client: {err}"),
            })?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

/// Completion backend selected by configuration.
#[derive(Debug, Clone)]
pub enum AiProvider {
    OpenAi(Backend),
    Anthropic(Backend),
}

impl AiProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let kind = ProviderKind::parse(&settings.ai_provider)
            .ok_or_else(|| ProviderError::Unsupported(settings.ai_provider.clone()))?;
        let api_key = settings
            .api_key_for(kind)
            .ok_or(ProviderError::NotConfigured {
                provider: kind.id(),
                env: kind.key_env(),
            })?;
        let model = settings
            .ai_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(kind.default_model());
        let backend = Backend::new(
            api_key,
            model,
            settings.base_url_for(kind),
            Duration::from_secs(settings.ai_timeout_secs),
        )?;
        Ok(Self::with_backend(kind, backend))
    }

    pub fn with_backend(kind: ProviderKind, backend: Backend) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::OpenAi(backend),
            ProviderKind::Anthropic => Self::Anthropic(backend),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::OpenAi(_) => ProviderKind::OpenAi,
            Self::Anthropic(_) => ProviderKind::Anthropic,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::OpenAi(b) | Self::Anthropic(b) => &b.model,
        }
    }

    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        options: CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        match self {
            Self::OpenAi(backend) => complete_openai(backend, system, user, options).await,
            Self::Anthropic(backend) => complete_anthropic(backend, system, user, options).await,
        }
    }
}

async fn complete_openai(
    backend: &Backend,
    system: &str,
    user: &str,
    options: CompletionOptions,
) -> Result<Completion, ProviderError> {
    let provider = ProviderKind::OpenAi.id();
    let payload = serde_json::json!({
        "model": backend.model,
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ],
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
    });
    let request = backend
        .client
        .post(backend.endpoint("/v1/chat/completions"))
        .bearer_auth(&backend.api_key)
        .json(&payload);
    let body = send_json(provider, request).await?;

    let content = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|val| val.as_str())
        .ok_or_else(|| ProviderError::MalformedResponse {
            provider,
            reason: "missing choices[0].message.content".to_string(),
        })?
        .to_string();

    Ok(Completion {
        content,
        model: backend.model.clone(),
        provider: ProviderKind::OpenAi,
        usage: extract_openai_usage(&body),
    })
}

async fn complete_anthropic(
    backend: &Backend,
    system: &str,
    user: &str,
    options: CompletionOptions,
) -> Result<Completion, ProviderError> {
    let provider = ProviderKind::Anthropic.id();
    let payload = serde_json::json!({
        "model": backend.model,
        "max_tokens": options.max_tokens,
        "system": if system.is_empty() { Value::Null } else { Value::String(system.to_string()) },
        "messages": [
            { "role": "user", "content": [{ "type": "text", "text": user }] },
        ],
        "temperature": options.temperature,
    });
    let request = backend
        .client
        .post(backend.endpoint("/v1/messages"))
        .header("x-api-key", &backend.api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&payload);
    let body = send_json(provider, request).await?;

    let parts = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ProviderError::MalformedResponse {
            provider,
            reason: "missing content array".to_string(),
        })?;
    let content = parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if content.is_empty() {
        return Err(ProviderError::MalformedResponse {
            provider,
            reason: "no text content blocks".to_string(),
        });
    }

    Ok(Completion {
        content,
        model: backend.model.clone(),
        provider: ProviderKind::Anthropic,
        usage: extract_anthropic_usage(&body),
    })
}

async fn send_json(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<Value, ProviderError> {
    let response = request.send().await.map_err(|err| {
        if err.is_timeout() {
            ProviderError::Timeout { provider }
        } else {
            ProviderError::Network {
                provider,
                message: err.to_string(),
            }
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { provider },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::InvalidApiKey { provider }
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                ProviderError::Http {
                    provider,
                    status: other.as_u16(),
                    body: body.chars().take(500).collect(),
                }
            }
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|err| ProviderError::MalformedResponse {
            provider,
            reason: err.to_string(),
        })
}

fn extract_openai_usage(body: &Value) -> Option<UsageMetrics> {
    body.get("usage").map(|usage| UsageMetrics {
        prompt_tokens: read_u32(usage, "prompt_tokens"),
        completion_tokens: read_u32(usage, "completion_tokens"),
        total_tokens: read_u32(usage, "total_tokens"),
    })
}

fn extract_anthropic_usage(body: &Value) -> Option<UsageMetrics> {
    body.get("usage").map(|usage| {
        let input = read_u32(usage, "input_tokens");
        let output = read_u32(usage, "output_tokens");
        UsageMetrics {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input.zip(output).map(|(i, o)| i.saturating_add(o)),
        }
    })
}

fn read_u32(usage: &Value, key: &str) -> Option<u32> {
    usage
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> Backend {
        Backend::new("test-key", "test-model", server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn openai_completion_reads_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "hello" } }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 }
            })))
            .mount(&server)
            .await;

        let provider = AiProvider::with_backend(ProviderKind::OpenAi, backend(&server));
        let completion = provider
            .complete("sys", "user", CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.usage.and_then(|u| u.total_tokens), Some(4));
    }

    #[tokio::test]
    async fn anthropic_completion_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{ "type": "text", "text": "{\"ok\":" }, { "type": "text", "text": "true}" }],
                "usage": { "input_tokens": 10, "output_tokens": 2 }
            })))
            .mount(&server)
            .await;

        let provider = AiProvider::with_backend(ProviderKind::Anthropic, backend(&server));
        let completion = provider
            .complete("sys", "user", CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(completion.content, "{\"ok\":true}");
        assert_eq!(completion.usage.and_then(|u| u.total_tokens), Some(12));
    }

    #[tokio::test]
    async fn status_codes_map_to_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let openai = AiProvider::with_backend(ProviderKind::OpenAi, backend(&server));
        let err = openai
            .complete("s", "u", CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));

        let anthropic = AiProvider::with_backend(ProviderKind::Anthropic, backend(&server));
        let err = anthropic
            .complete("s", "u", CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidApiKey { .. }));
    }

    #[tokio::test]
    async fn missing_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
            .mount(&server)
            .await;
        let provider = AiProvider::with_backend(ProviderKind::OpenAi, backend(&server));
        let err = provider
            .complete("s", "u", CompletionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AI-1007");
    }

    #[test]
    fn oversized_usage_counts_do_not_overflow() {
        let usage = extract_anthropic_usage(&serde_json::json!({
            "usage": { "input_tokens": u32::MAX, "output_tokens": 10 }
        }))
        .unwrap();
        assert_eq!(usage.prompt_tokens, Some(u32::MAX));
        assert_eq!(usage.total_tokens, Some(u32::MAX));

        let usage = extract_openai_usage(&serde_json::json!({
            "usage": { "prompt_tokens": 5_000_000_000u64, "completion_tokens": 2 }
        }))
        .unwrap();
        assert_eq!(usage.prompt_tokens, None);
        assert_eq!(usage.completion_tokens, Some(2));
        assert_eq!(usage.total_tokens, None);
    }

    #[test]
    fn missing_key_is_not_configured() {
        let settings = Settings {
            ai_provider: "anthropic".to_string(),
            openai_api_key: Some("sk-openai".to_string()),
            ..Settings::default()
        };
        let err = AiProvider::from_settings(&settings).unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotConfigured {
                provider: "anthropic",
                ..
            }
        ));
    }
}
