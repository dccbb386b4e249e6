//! Completion providers.
//!
//! The parser treats a provider as an opaque, possibly-unavailable oracle:
//! every failure mode is a [`ProviderFailure`] value and is never propagated
//! past the parser, which falls back to the heuristic extractor instead.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Anthropic,
    /// No remote provider; every proposal goes through the heuristic extractor.
    Offline,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Openai => write!(f, "openai"),
            Provider::Anthropic => write!(f, "anthropic"),
            Provider::Offline => write!(f, "offline"),
        }
    }
}

impl Provider {
    /// Environment variable holding the API key, if the provider needs one.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            Provider::Openai => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Offline => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CompletionRequest / ProviderFailure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Why a completion could not be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderFailure {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("malformed completion: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderFailure>;
}

// -- OpenAI chat types ------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct OpenAIChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAIChatRequest {
    pub model: String,
    pub messages: Vec<OpenAIChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChatResponse {
    pub choices: Vec<OpenAIChoice>,
}

// -- Anthropic message types ------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    pub content: Vec<AnthropicContentBlock>,
}

// ---------------------------------------------------------------------------
// HttpCompletionProvider
// ---------------------------------------------------------------------------

/// Chat-completion client for OpenAI or Anthropic.
pub struct HttpCompletionProvider {
    client: reqwest::Client,
    provider: Provider,
    model: String,
    api_key: String,
    base_url: String,
}

impl HttpCompletionProvider {
    /// Build a client reading the API key from the environment.
    pub fn from_env(provider: Provider, model: impl Into<String>) -> Result<Self, ProviderFailure> {
        let var = provider
            .api_key_var()
            .ok_or_else(|| ProviderFailure::Unavailable(format!("{provider} has no HTTP API")))?;
        let api_key = env::var(var)
            .map_err(|_| ProviderFailure::Unavailable(format!("{var} not set")))?;
        let base_url = match provider {
            Provider::Anthropic => "https://api.anthropic.com",
            _ => "https://api.openai.com",
        };
        Ok(Self::new(provider, model, api_key, base_url))
    }

    pub fn new(
        provider: Provider,
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call_openai(&self, request: &CompletionRequest) -> Result<String, ProviderFailure> {
        let body = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIChatMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(request.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, request.timeout))?;
        let response = check_status(response).await?;
        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| ProviderFailure::Malformed("no choices in completion".into()))
    }

    async fn call_anthropic(&self, request: &CompletionRequest) -> Result<String, ProviderFailure> {
        let body = AnthropicRequest {
            model: self.model.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(request.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, request.timeout))?;
        let response = check_status(response).await?;
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;
        parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .find_map(|b| b.text)
            .ok_or_else(|| ProviderFailure::Malformed("no text block in completion".into()))
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        match self.provider {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Offline => "offline",
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderFailure> {
        let call = async {
            match self.provider {
                Provider::Openai => self.call_openai(request).await,
                Provider::Anthropic => self.call_anthropic(request).await,
                Provider::Offline => {
                    Err(ProviderFailure::Unavailable("offline provider".into()))
                }
            }
        };
        match tokio::time::timeout(request.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderFailure::Timeout(request.timeout)),
        }
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> ProviderFailure {
    if err.is_timeout() {
        ProviderFailure::Timeout(timeout)
    } else {
        ProviderFailure::Unavailable(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(ProviderFailure::Http { status: status.as_u16(), detail })
}

// ---------------------------------------------------------------------------
// OfflineProvider / ScriptedProvider
// ---------------------------------------------------------------------------

/// Provider that is always unavailable.
pub struct OfflineProvider;

#[async_trait]
impl CompletionProvider for OfflineProvider {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderFailure> {
        Err(ProviderFailure::Unavailable("offline mode".into()))
    }
}

/// Provider returning a fixed outcome; counts how often it was called.
pub struct ScriptedProvider {
    outcome: Result<String, ProviderFailure>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn responding(text: impl Into<String>) -> Self {
        Self { outcome: Ok(text.into()), delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    pub fn failing(failure: ProviderFailure) -> Self {
        Self { outcome: Err(failure), delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    /// Sleep before answering; longer than the request timeout simulates a hang.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            if tokio::time::timeout(request.timeout, tokio::time::sleep(self.delay))
                .await
                .is_err()
            {
                return Err(ProviderFailure::Timeout(request.timeout));
            }
        }
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "p".into(),
            temperature: 0.0,
            max_tokens: 16,
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_provider_display() {
        assert_eq!(Provider::Openai.to_string(), "openai");
        assert_eq!(Provider::Anthropic.to_string(), "anthropic");
        assert_eq!(Provider::Offline.to_string(), "offline");
    }

    #[test]
    fn test_provider_api_key_vars() {
        assert_eq!(Provider::Openai.api_key_var(), Some("OPENAI_API_KEY"));
        assert_eq!(Provider::Anthropic.api_key_var(), Some("ANTHROPIC_API_KEY"));
        assert_eq!(Provider::Offline.api_key_var(), None);
    }

    #[test]
    fn test_openai_request_serializes() {
        let req = OpenAIChatRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![OpenAIChatMessage { role: "user".into(), content: "hi".into() }],
            temperature: 0.0,
            max_tokens: 10,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"max_tokens\":10"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn test_anthropic_response_deserializes() {
        let raw = r#"{"content":[{"type":"text","text":"{\"a\":1}"}]}"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content[0].text.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_openai_response_deserializes() {
        let raw = r#"{"choices":[{"message":{"content":"ok"}}]}"#;
        let parsed: OpenAIChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_offline_provider_is_unavailable() {
        let err = OfflineProvider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderFailure::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_scripted_provider_times_out() {
        let p = ScriptedProvider::responding("x").with_delay(Duration::from_secs(5));
        let err = p.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderFailure::Timeout(_)));
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_provider_responds() {
        let p = ScriptedProvider::responding("hello");
        assert_eq!(p.complete(&request()).await.unwrap(), "hello");
    }
}
