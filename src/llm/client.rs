//! LLM client trait and provider implementations.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// The single abstract LLM operation the core depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run an inference over user messages with an optional system prompt,
    /// returning the raw completion text.
    ///
    /// Rate-limit failures must surface as [`Error::RateLimited`] so callers
    /// can back off.
    async fn infer(&self, messages: &[String], system_prompt: Option<&str>) -> Result<String>;

    /// Provider identifier, for logging.
    fn provider(&self) -> &str;
}

/// Environment-driven configuration for LLM clients.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key
    pub api_key: String,
    /// Model identifier (e.g. "gemini-2.5-flash")
    pub model: String,
    /// Base URL override
    pub base_url: Option<String>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    /// Sampling seed, where the provider supports it
    pub seed: Option<u64>,
    /// Optional project id forwarded to the provider
    pub project_id: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            temperature: 0.0,
            top_p: 0.95,
            max_tokens: 2000,
            seed: Some(42),
            project_id: None,
            timeout_secs: 120,
        }
    }

    /// Build a config from the environment.
    ///
    /// Recognized keys: `SREMETA_LLM_API_KEY` (falling back to
    /// `GEMINI_API_KEY` then `GOOGLE_API_KEY`), `SREMETA_LLM_MODEL`,
    /// `SREMETA_LLM_BASE_URL`, `SREMETA_PROJECT_ID`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SREMETA_LLM_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| Error::Config("no LLM API key in environment".to_string()))?;
        let model =
            std::env::var("SREMETA_LLM_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());

        let mut config = Self::new(api_key, model);
        config.base_url = std::env::var("SREMETA_LLM_BASE_URL").ok();
        config.project_id = std::env::var("SREMETA_PROJECT_ID").ok();
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))
}

/// Google Gemini client.
pub struct GeminiClient {
    config: LlmConfig,
    http: Client,
}

impl GeminiClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Gemini API types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    status: Option<String>,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn infer(&self, messages: &[String], system_prompt: Option<&str>) -> Result<String> {
        let contents: Vec<GeminiContent> = messages
            .iter()
            .map(|m| GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: m.clone() }],
            })
            .collect();

        let system_instruction = system_prompt.map(|s| GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart { text: s.to_string() }],
        });

        let api_request = GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                seed: self.config.seed,
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url(),
            self.config.model,
            self.config.api_key
        );

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
                if status == StatusCode::TOO_MANY_REQUESTS
                    || error.error.status.as_deref() == Some("RESOURCE_EXHAUSTED")
                {
                    return Err(Error::rate_limited("gemini", error.error.message));
                }
                return Err(Error::Llm(format!("Gemini API error: {}", error.error.message)));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::rate_limited("gemini", body));
            }
            return Err(Error::Llm(format!("Gemini API error ({}): {}", status, body)));
        }

        let api_response: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("failed to parse response: {}", e)))?;

        let candidate = api_response
            .candidates
            .first()
            .ok_or_else(|| Error::Llm("no candidates in response".to_string()))?;

        Ok(candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join(""))
    }

    fn provider(&self) -> &str {
        "gemini"
    }
}

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiCompatClient {
    config: LlmConfig,
    http: Client,
}

impl OpenAiCompatClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn infer(&self, messages: &[String], system_prompt: Option<&str>) -> Result<String> {
        let mut api_messages = Vec::new();
        if let Some(system) = system_prompt {
            api_messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        for m in messages {
            api_messages.push(OpenAiMessage {
                role: "user".to_string(),
                content: m.clone(),
            });
        }

        let api_request = OpenAiRequest {
            model: self.config.model.clone(),
            messages: api_messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            seed: self.config.seed,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<OpenAiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::rate_limited("openai", message));
            }
            return Err(Error::Llm(format!("OpenAI API error ({}): {}", status, message)));
        }

        let api_response: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("failed to parse response: {}", e)))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Llm("no choices in response".to_string()))?;

        Ok(choice.message.content)
    }

    fn provider(&self) -> &str {
        "openai"
    }
}

/// Scripted client for tests: pops pre-loaded replies in order and records
/// every request it receives.
pub struct MockLlm {
    replies: Mutex<Vec<Result<String>>>,
    requests: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        // Queue is popped front-first; push to the back.
        self.replies.try_lock().unwrap().push(Ok(text.into()));
        self
    }

    /// Queue an error reply.
    pub fn error(self, error: Error) -> Self {
        self.replies.try_lock().unwrap().push(Err(error));
        self
    }

    /// Prompts received so far, in order.
    pub async fn received(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn infer(&self, messages: &[String], _system_prompt: Option<&str>) -> Result<String> {
        self.requests.lock().await.push(messages.join("\n"));
        let mut replies = self.replies.lock().await;
        if replies.is_empty() {
            return Err(Error::Llm("mock has no more scripted replies".to_string()));
        }
        replies.remove(0)
    }

    fn provider(&self) -> &str {
        "mock"
    }
}
