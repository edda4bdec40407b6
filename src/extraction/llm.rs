//! Language-model code extractor.
//!
//! Sends one source per request to an OpenAI-compatible chat completions
//! endpoint and asks for codes as JSON. The model's answer is parsed into
//! an untyped [`Value`] and validated by the caller like any other oracle
//! response.

use super::{CodeExtractionOracle, ExtractionContext, OracleError, OracleResult};
use crate::models::SourceContent;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default chat model.
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Longest source excerpt sent to the model, in characters.
const MAX_PROMPT_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are a qualitative researcher performing initial coding for a \
reflexive thematic analysis. Reply with a single JSON object of the form \
{\"codes\": [{\"label\": string, \"description\": string, \"confidence\": number}]}. \
Labels are two to five words. Descriptions are one sentence grounded in the text. \
Confidence is between 0 and 1. Do not add any other keys or prose.";

/// Code extraction oracle backed by a chat completions API.
#[derive(Debug, Clone)]
pub struct LlmCodeOracle {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl LlmCodeOracle {
    /// Create an oracle for the OpenAI API.
    ///
    /// # Errors
    /// Returns `OracleError::ConfigError` if the key is empty or the HTTP
    /// client cannot be built
    pub fn new(api_key: &str, model: Option<String>) -> OracleResult<Self> {
        Self::with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    /// Create an oracle for any OpenAI-compatible endpoint.
    pub fn with_base_url(api_key: &str, model: Option<String>, base_url: &str) -> OracleResult<Self> {
        if api_key.trim().is_empty() {
            return Err(OracleError::ConfigError("missing API key".to_string()));
        }
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| OracleError::ConfigError("invalid API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| OracleError::ConfigError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            temperature: 0.0,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn user_prompt(source: &SourceContent, context: &ExtractionContext) -> String {
        let budget = context.code_budget(source.word_count);
        let excerpt: String = source.text.chars().take(MAX_PROMPT_CHARS).collect();
        let title = source
            .title
            .as_deref()
            .map(|t| format!("Title: {}\n", t))
            .unwrap_or_default();
        format!(
            "Research purpose: {}\nFocus: {}\nGranularity: {}\n\
             Return at most {} codes.\n\n{}Text ({}):\n{}",
            context.purpose,
            context.focus,
            context.granularity,
            budget,
            title,
            match source.content_kind {
                crate::models::ContentKind::Abstract => "abstract",
                crate::models::ContentKind::FullText => "full text",
            },
            excerpt
        )
    }
}

/// Parse the assistant message into JSON, tolerating a fenced code block.
fn parse_content(content: &str) -> OracleResult<Value> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| OracleError::InvalidResponse(format!("model did not return JSON: {}", e)))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CodeExtractionOracle for LlmCodeOracle {
    async fn extract_codes(
        &self,
        source: &SourceContent,
        context: &ExtractionContext,
    ) -> OracleResult<Value> {
        let prompt = Self::user_prompt(source, context);
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                OracleError::RateLimited(text)
            } else if status.is_server_error() {
                OracleError::Unavailable(format!("{}: {}", status, text))
            } else {
                OracleError::ConfigError(format!("{}: {}", status, text))
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(format!("failed to parse response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| OracleError::InvalidResponse("empty completion".to_string()))?;
        parse_content(&content)
    }

    fn name(&self) -> &str {
        "llm"
    }
}
