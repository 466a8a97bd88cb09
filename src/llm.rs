//! Language-model abstraction.
//!
//! The analyzer and the judge only see [`LanguageModel`]: a prompt goes in,
//! text comes out. Concrete backends:
//!
//! - **[`AnthropicModel`]** calls the Anthropic messages API. Requires
//!   `ANTHROPIC_API_KEY`.
//! - **[`DisabledModel`]** fails every call with a permanent error, so
//!   retrieval-only commands work without credentials.
//!
//! Every call made through [`generate`] carries a hard timeout and gets at
//! most one retry on a transient failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::retry::{retry_once, with_timeout};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier recorded alongside outputs.
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Call policy shared by every caller of a model.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl From<&LlmConfig> for CallPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Complete `request` under `policy`: timeout per attempt, one retry on a
/// transient failure.
pub async fn generate(
    model: &dyn LanguageModel,
    request: &CompletionRequest,
    policy: CallPolicy,
) -> Result<String> {
    let operation = model.model_name().to_string();
    retry_once(&operation, policy.backoff, || {
        with_timeout(&operation, policy.timeout, model.complete(request))
    })
    .await
}

pub struct AnthropicModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            Error::Config("ANTHROPIC_API_KEY environment variable not set".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build Anthropic HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.trim().to_string(),
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
struct ContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

fn response_text(response: MessagesResponse) -> Result<String> {
    let text = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(text),
            ResponseBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return Err(Error::permanent("Anthropic response has no text content"));
    }
    Ok(text)
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![Message {
                role: "user",
                content: vec![ContentBlock {
                    kind: "text",
                    text: &request.prompt,
                }],
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_transport("Anthropic messages", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::from_status("Anthropic messages", status, &text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::permanent(format!("invalid Anthropic response: {}", e)))?;
        response_text(parsed)
    }
}

/// Stand-in used when no model is configured.
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        Err(Error::permanent(
            "no language model configured; set [llm] provider = \"anthropic\"",
        ))
    }
}

/// Create the configured [`LanguageModel`].
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicModel::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledModel)),
        other => Err(Error::Config(format!("Unknown llm provider: {}", other))),
    }
}
