//! LLM provider adapters.
//!
//! [`LlmProvider`] is the only surface the test generators see. Anthropic and
//! OpenAI implementations are thin request/response mappings over `reqwest`.

use crate::core::config::{LlmConfig, LlmProviderKind};
use crate::core::error::CustodesError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, CustodesError>;
}

const DEFAULT_MAX_TOKENS: u32 = 1024;

fn http_client() -> Result<reqwest::Client, CustodesError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("custodes/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

async fn read_body(response: reqwest::Response, provider: &str) -> Result<String, CustodesError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(CustodesError::GeneratorError(format!(
            "{} API request failed with status {}: {}",
            provider,
            status,
            crate::core::output::compact_line(&text, 200)
        )));
    }
    Ok(text)
}

// --- Anthropic ---

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self, CustodesError> {
        Ok(Self {
            client: http_client()?,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, CustodesError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens,
            system,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;
        let body = read_body(response, "Anthropic").await?;
        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(CustodesError::GeneratorError(
                "Anthropic returned no text content".to_string(),
            ));
        }
        Ok(text)
    }
}

// --- OpenAI ---

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self, CustodesError> {
        Ok(Self {
            client: http_client()?,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, CustodesError> {
        let request = OpenAiRequest {
            model: &self.model,
            max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let body = read_body(response, "OpenAI").await?;
        let parsed: OpenAiResponse = serde_json::from_str(&body)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CustodesError::GeneratorError("OpenAI returned no choices".to_string()))
    }
}

/// Build the configured provider. A missing API key disables the provider
/// with a warning rather than failing startup.
pub fn build_provider(cfg: &LlmConfig) -> Result<Option<Arc<dyn LlmProvider>>, CustodesError> {
    let (default_env, default_base, default_model) = match cfg.provider {
        LlmProviderKind::None => return Ok(None),
        LlmProviderKind::Anthropic => (
            "ANTHROPIC_API_KEY",
            "https://api.anthropic.com",
            "claude-3-5-haiku-latest",
        ),
        LlmProviderKind::Openai => ("OPENAI_API_KEY", "https://api.openai.com", "gpt-4o-mini"),
    };
    let key_env = if cfg.api_key_env.is_empty() {
        default_env
    } else {
        cfg.api_key_env.as_str()
    };
    let api_key = match std::env::var(key_env) {
        Ok(k) if !k.trim().is_empty() => k,
        _ => {
            tracing::warn!(env = key_env, "LLM API key not set; LLM test generator disabled");
            return Ok(None);
        }
    };
    let base = if cfg.api_base.is_empty() {
        default_base
    } else {
        cfg.api_base.as_str()
    };
    let model = if cfg.model.is_empty() {
        default_model
    } else {
        cfg.model.as_str()
    };

    let provider: Arc<dyn LlmProvider> = match cfg.provider {
        LlmProviderKind::Anthropic => Arc::new(AnthropicProvider::new(&api_key, base, model)?),
        LlmProviderKind::Openai => Arc::new(OpenAiProvider::new(&api_key, base, model)?),
        LlmProviderKind::None => return Ok(None),
    };
    Ok(Some(provider))
}

pub fn effective_max_tokens(cfg: &LlmConfig) -> u32 {
    if cfg.max_tokens == 0 {
        DEFAULT_MAX_TOKENS
    } else {
        cfg.max_tokens
    }
}
