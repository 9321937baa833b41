use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Ollama,
    OpenAi,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "ollama" => Some(LlmProvider::Ollama),
            "openai" => Some(LlmProvider::OpenAi),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Prompt in, text out. Reranking and answering both go through this seam and
/// differ only in the prompt they send.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    Ollama(OllamaConfig),
    OpenAi(OpenAiConfig),
    Local,
}

#[derive(Clone)]
struct OllamaConfig {
    base_url: String,
}

#[derive(Clone)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
}

impl LlmClient {
    /// Builds a client from the provider's environment variables. A remote
    /// provider without its endpoint or key is rejected here rather than on
    /// the first request.
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let config = match provider {
            LlmProvider::Ollama => ProviderConfig::Ollama(OllamaConfig {
                base_url: read_required("OLLAMA_BASE_URL")?,
            }),
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: read_required("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Self::build(provider, model.into(), config, DEFAULT_TIMEOUT)
    }

    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(anyhow!("ollama base url must not be empty"));
        }
        Self::build(
            LlmProvider::Ollama,
            model.into(),
            ProviderConfig::Ollama(OllamaConfig { base_url }),
            DEFAULT_TIMEOUT,
        )
    }

    pub fn local() -> Self {
        Self {
            http: Client::new(),
            provider: LlmProvider::Local,
            model: "local".to_string(),
            config: ProviderConfig::Local,
        }
    }

    fn build(
        provider: LlmProvider,
        model: String,
        config: ProviderConfig,
        timeout: Duration,
    ) -> Result<Self> {
        if model.trim().is_empty() && provider != LlmProvider::Local {
            return Err(anyhow!(format!(
                "a model name is required for the {} provider",
                provider.as_str()
            )));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            provider,
            model,
            config,
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self> {
        Self::build(self.provider, self.model, self.config, timeout)
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::Ollama(cfg) => self.chat_ollama(cfg, req).await,
            ProviderConfig::OpenAi(cfg) => self.chat_openai(cfg, req).await,
            ProviderConfig::Local => Ok(self.chat_local(req)),
        }
    }

    async fn chat_ollama(&self, cfg: &OllamaConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/generate", cfg.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": req.prompt,
            "stream": false,
        });
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("ollama request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(format!(
                "ollama returned error (status {}): {}",
                status, body
            )));
        }
        let parsed = response
            .json::<OllamaGenerateResponse>()
            .await
            .context("failed to decode ollama response")?;
        Ok(LlmResponse {
            content: parsed.response,
            prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
            completion_tokens: parsed.eval_count.unwrap_or(0),
        })
    }

    async fn chat_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": req.prompt }],
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&cfg.api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| "openai request failed")?;
        let value = decode_openai_body(response).await?;
        let content = extract_openai_text(&value)
            .ok_or_else(|| anyhow!("missing text in OpenAI response"))?;
        let usage: OpenAiUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    fn chat_local(&self, req: &LlmRequest) -> LlmResponse {
        LlmResponse {
            content: synthesize_local_response(req),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

#[async_trait]
impl GenerationService for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self
            .chat(&LlmRequest {
                prompt: prompt.to_string(),
            })
            .await?;
        debug!(
            provider = self.provider.as_str(),
            model = %self.model,
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            "generation finished"
        );
        Ok(response.content)
    }
}

/// Offline stand-in for a real model. Rerank prompts get their chunk numbers
/// back in order; answer prompts get the first context chunk, cited.
fn synthesize_local_response(req: &LlmRequest) -> String {
    let user_lower = req.prompt.to_lowercase();
    if user_lower.contains("most relevant chunk numbers") {
        let listing = extract_context_block(&req.prompt, "Chunks:", "Question:");
        let numbers = listing
            .lines()
            .filter_map(|line| {
                let (head, _) = line.trim().split_once('.')?;
                head.parse::<usize>().ok()
            })
            .map(|n| n.to_string())
            .collect::<Vec<_>>();
        return numbers.join(", ");
    }
    if user_lower.contains("with chunk ids for citation") {
        let context = extract_context_block(&req.prompt, "citation):", "Question:");
        let first = context.lines().map(str::trim).find(|line| !line.is_empty());
        if let Some(entry) = first {
            if let Some((label, text)) = entry.split_once("): ") {
                if let Some((_, id)) = label.split_once("(ID: ") {
                    return format!("{} (Chunk ID: {})", summarize_text(text, 40), id);
                }
            }
        }
        return "I don't know.".to_string();
    }
    summarize_text(&req.prompt, 40)
}

async fn decode_openai_body(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!(format!(
            "openai returned error (status {}): {}",
            status, body
        )));
    }
    serde_json::from_str(&body).context("failed to decode openai response")
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(|text| text.to_string())
}

fn extract_context_block(text: &str, start_marker: &str, stop_marker: &str) -> String {
    if let Some(start_idx) = text.find(start_marker) {
        let after = &text[start_idx + start_marker.len()..];
        if let Some(end_idx) = after.find(stop_marker) {
            return after[..end_idx].trim().to_string();
        }
        return after.trim().to_string();
    }
    text.trim().to_string()
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn read_required(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!(format!("{var} is not set")))?;
    if value.trim().is_empty() {
        return Err(anyhow!(format!("{var} is empty")));
    }
    Ok(value)
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}
