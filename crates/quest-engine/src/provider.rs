use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use quest_contracts::paths::non_empty_env;

use crate::normalize::jpeg_data_url;

pub const QUEST_HELP_MODEL: &str = "gpt-4-turbo";
pub const QUEST_HELP_MAX_TOKENS: u64 = 500;
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

const QUEST_HELP_INSTRUCTION: &str = "I'm stuck in this game and need help with what to do next. Please analyze this screenshot and provide clear, step-by-step guidance on how to proceed. Focus on: 1) What quest or objective I'm currently on, 2) What I should do next to progress, 3) Any important details or hints visible in the screenshot.";

pub fn quest_help_instruction() -> &'static str {
    QUEST_HELP_INSTRUCTION
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionRequest {
    pub model: String,
    pub instruction: String,
    pub image_base64: String,
    pub max_tokens: u64,
}

impl VisionRequest {
    pub fn quest_help(image_base64: impl Into<String>) -> Self {
        Self {
            model: QUEST_HELP_MODEL.to_string(),
            instruction: QUEST_HELP_INSTRUCTION.to_string(),
            image_base64: image_base64.into(),
            max_tokens: QUEST_HELP_MAX_TOKENS,
        }
    }

    /// Chat-completion body: one user turn with the instruction and the image.
    pub fn chat_payload(&self) -> Value {
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": self.instruction},
                    {"type": "image_url", "image_url": {"url": jpeg_data_url(&self.image_base64)}},
                ],
            }],
            "max_tokens": self.max_tokens,
        })
    }
}

pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &VisionRequest) -> Result<String>;
}

/// Builds a provider bound to an API key.
pub type ProviderFactory = Box<dyn Fn(&str) -> Box<dyn VisionProvider> + Send + Sync>;

pub fn openai_provider_factory() -> ProviderFactory {
    Box::new(|api_key| Box::new(OpenAiChatProvider::new(api_key)))
}

pub struct OpenAiChatProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiChatProvider {
    pub fn new(api_key: &str) -> Self {
        Self::with_base(api_key, &openai_api_base())
    }

    pub fn with_base(api_key: &str, api_base: &str) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

impl VisionProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn complete(&self, request: &VisionRequest) -> Result<String> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.chat_payload())
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        extract_chat_message_text(&parsed)
    }
}

pub fn openai_api_base() -> String {
    let raw = non_empty_env("OPENAI_API_BASE")
        .or_else(|| non_empty_env("OPENAI_BASE_URL"))
        .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string());
    let mut base = raw.trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base
}

/// `choices[0].message.content` of a chat-completion response.
pub fn extract_chat_message_text(response: &Value) -> Result<String> {
    let Some(message) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
    else {
        bail!("OpenAI response contained no choices");
    };
    match message.get("content") {
        Some(Value::String(text)) => Ok(text.clone()),
        _ => bail!("OpenAI response message had no text content"),
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
