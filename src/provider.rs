//! Question Provider Abstraction
//!
//! Interface the pipeline uses to obtain generated questions from an AI model, plus an
//! OpenAI-compatible `/chat/completions` client that sends every request through the
//! retry transport.

use crate::error::GenerationError;
use crate::transport::{send_request_with_retry, RetryPolicy};
use crate::types::{Difficulty, GeneratedQuestion, GenerationRequest, QuestionType};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What one provider call is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPrompt {
    pub topic: String,
    pub count: u32,
    pub difficulty: Difficulty,
    pub question_types: Vec<QuestionType>,
    pub data_source_id: Option<String>,
}

impl GenerationPrompt {
    /// Prompt for one batch of `count` questions drawn from `request`.
    pub fn for_batch(request: &GenerationRequest, count: u32) -> Self {
        Self {
            topic: request.topic.clone(),
            count,
            difficulty: request.difficulty,
            question_types: request.question_types.clone(),
            data_source_id: request.data_source_id.clone(),
        }
    }

    pub fn system_message(&self) -> String {
        "You write quiz questions. Reply with a JSON array only, no prose and no markdown. \
         Each element is an object with the fields \"question_type\", \"stem\", \"options\", \
         \"answer\", \"explanation\" and \"difficulty\"."
            .to_string()
    }

    pub fn user_message(&self) -> String {
        let types: Vec<&str> = self.question_types.iter().map(|t| t.as_str()).collect();
        let mut message = format!(
            "Generate exactly {} questions about \"{}\".\nDifficulty: {}.\nAllowed question_type values: {}.",
            self.count,
            self.topic,
            self.difficulty,
            types.join(", ")
        );
        if let Some(source) = &self.data_source_id {
            message.push_str(&format!(
                "\nBase the questions only on material from data source \"{}\".",
                source
            ));
        }
        message.push_str(
            "\nUse an empty \"options\" array for question types without choices. \
             Return the JSON array and nothing else.",
        );
        message
    }
}

/// Source of generated questions.
#[async_trait]
pub trait QuestionProvider: Send + Sync {
    /// Produce up to `prompt.count` questions.
    ///
    /// `cancel` interrupts retry backoff waits; a request already on the wire runs to
    /// completion.
    async fn generate(
        &self,
        prompt: &GenerationPrompt,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Kind of endpoint a provider entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    Ollama,
    Local,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Ollama => "ollama",
            ProviderType::Local => "local",
        }
    }

    fn default_base_url(self) -> Option<&'static str> {
        match self {
            ProviderType::OpenAI => Some("https://api.openai.com/v1"),
            ProviderType::Ollama => Some("http://localhost:11434/v1"),
            ProviderType::Local => None,
        }
    }
}

/// One `[providers.<name>]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Filled from the table key when omitted
    #[serde(default)]
    pub provider_name: Option<String>,
    pub provider_type: ProviderType,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL, e.g. `http://localhost:8080/v1`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!("Endpoint must be an http(s) URL: {}", endpoint));
            }
        }
        if self.provider_type == ProviderType::Local && self.endpoint.is_none() {
            return Err("Local providers require an endpoint".to_string());
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(format!("Temperature must be within 0.0-2.0, got {}", temperature));
            }
        }
        Ok(())
    }

    /// Configured endpoint, else the provider type's default.
    pub fn base_url(&self) -> Result<String, GenerationError> {
        self.endpoint
            .clone()
            .or_else(|| self.provider_type.default_base_url().map(str::to_string))
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                GenerationError::ProviderNotConfigured(format!(
                    "Provider {} has no endpoint",
                    self.provider_name.as_deref().unwrap_or("<unnamed>")
                ))
            })
    }

    /// Configured key, falling back to `OPENAI_API_KEY` for OpenAI entries.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| match self.provider_type {
            ProviderType::OpenAI => std::env::var("OPENAI_API_KEY").ok(),
            _ => None,
        })
    }
}

// OpenAI-compatible API request/response structures
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionPayload {
    List(Vec<GeneratedQuestion>),
    Wrapped { questions: Vec<GeneratedQuestion> },
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn build_provider_http_client() -> Result<Client, GenerationError> {
    Client::builder()
        .no_proxy()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(PROVIDER_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| GenerationError::ProviderError(format!("Failed to create HTTP client: {}", e)))
}

fn map_status_error(status: u16, body: String) -> GenerationError {
    match status {
        401 | 403 => GenerationError::ProviderAuthFailed(format!("Authentication failed: {}", body)),
        404 => GenerationError::ProviderModelNotFound(format!("Model not found: {}", body)),
        _ => GenerationError::ProviderRequestFailed(format!(
            "Request failed with status {}: {}",
            status, body
        )),
    }
}

/// Parse model output into questions. Accepts a bare array, an object with a
/// `questions` array, and either wrapped in a markdown code fence.
pub fn parse_questions(content: &str) -> Result<Vec<GeneratedQuestion>, GenerationError> {
    let body = strip_code_fence(content);
    let payload: QuestionPayload = serde_json::from_str(body).map_err(|e| {
        GenerationError::ProviderError(format!("Malformed question payload: {}", e))
    })?;
    Ok(match payload {
        QuestionPayload::List(questions) => questions,
        QuestionPayload::Wrapped { questions } => questions,
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

/// Client for any OpenAI-compatible chat completions endpoint (OpenAI, Ollama,
/// llama.cpp / vLLM servers).
pub struct ChatCompletionsProvider {
    client: Client,
    provider_name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    retry: RetryPolicy,
}

impl ChatCompletionsProvider {
    pub fn new(
        provider_name: impl Into<String>,
        config: &ProviderConfig,
        retry: RetryPolicy,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            client: build_provider_http_client()?,
            provider_name: provider_name.into(),
            model: config.model.clone(),
            api_key: config.resolve_api_key(),
            base_url: config.base_url()?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl QuestionProvider for ChatCompletionsProvider {
    async fn generate(
        &self,
        prompt: &GenerationPrompt,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: prompt.system_message(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.user_message(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(
            provider = %self.provider_name,
            model = %self.model,
            count = prompt.count,
            "Requesting questions from provider"
        );
        let response = send_request_with_retry(builder, &self.retry, cancel).await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status_error(status.as_u16(), error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::ProviderError(format!("Failed to parse response: {}", e)))?;
        let choice = completion
            .choices
            .first()
            .ok_or_else(|| GenerationError::ProviderError("No choices in response".to_string()))?;

        parse_questions(&choice.message.content)
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Provider entries by name, turned into clients on demand.
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
    default_provider: Option<String>,
    retry: RetryPolicy,
}

impl ProviderRegistry {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            retry,
        }
    }

    /// Load every `[providers.*]` entry from configuration.
    pub fn from_config(config: &crate::config::QuizgenConfig) -> Self {
        let mut registry = Self::new(config.retry.policy());
        for (name, provider_config) in &config.providers {
            registry.register(name, provider_config.clone());
        }
        registry.default_provider = config.default_provider.clone();
        registry
    }

    pub fn register(&mut self, name: &str, mut config: ProviderConfig) {
        if config.provider_name.is_none() {
            config.provider_name = Some(name.to_string());
        }
        self.providers.insert(name.to_string(), config);
    }

    pub fn get(&self, provider_name: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_name)
    }

    pub fn get_or_error(&self, provider_name: &str) -> Result<&ProviderConfig, GenerationError> {
        self.get(provider_name).ok_or_else(|| {
            GenerationError::ProviderNotConfigured(format!("Provider not found: {}", provider_name))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Name to use when the caller does not pick one: the configured default, or the
    /// only provider when exactly one is configured.
    pub fn default_name(&self) -> Result<&str, GenerationError> {
        if let Some(name) = &self.default_provider {
            return Ok(name.as_str());
        }
        match self.providers.len() {
            1 => Ok(self.providers.keys().map(String::as_str).next().unwrap_or_default()),
            0 => Err(GenerationError::ProviderNotConfigured(
                "No providers configured".to_string(),
            )),
            _ => Err(GenerationError::ProviderNotConfigured(
                "Several providers configured and no default_provider set".to_string(),
            )),
        }
    }

    pub fn create_provider(
        &self,
        provider_name: Option<&str>,
    ) -> Result<Arc<dyn QuestionProvider>, GenerationError> {
        let name = match provider_name {
            Some(name) => name,
            None => self.default_name()?,
        };
        let config = self.get_or_error(name)?;
        Ok(Arc::new(ChatCompletionsProvider::new(name, config, self.retry)?))
    }
}

// Mock provider for testing
#[cfg(test)]
pub struct MockProvider {
    responses: parking_lot::Mutex<std::collections::VecDeque<Result<Vec<GeneratedQuestion>, GenerationError>>>,
    prompts: parking_lot::Mutex<Vec<GenerationPrompt>>,
}

#[cfg(test)]
impl MockProvider {
    /// Scripted replies are served in order; once they run out every call returns
    /// `prompt.count` questions.
    pub fn new(responses: Vec<Result<Vec<GeneratedQuestion>, GenerationError>>) -> Self {
        Self {
            responses: parking_lot::Mutex::new(responses.into()),
            prompts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<GenerationPrompt> {
        self.prompts.lock().clone()
    }

    pub fn question(n: u32) -> GeneratedQuestion {
        GeneratedQuestion {
            question_type: QuestionType::SingleChoice,
            stem: format!("Question {}", n),
            options: vec!["a".to_string(), "b".to_string()],
            answer: "a".to_string(),
            explanation: None,
            difficulty: Difficulty::Medium,
        }
    }

    pub fn questions(n: u32) -> Vec<GeneratedQuestion> {
        (0..n).map(Self::question).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl QuestionProvider for MockProvider {
    async fn generate(
        &self,
        prompt: &GenerationPrompt,
        _cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        self.prompts.lock().push(prompt.clone());
        match self.responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(Self::questions(prompt.count)),
        }
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}
