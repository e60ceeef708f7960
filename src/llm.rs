//! LLM access for event extraction.
//!
//! [`ChatModel`] is the seam: anything that turns a system + user prompt
//! into a JSON string. [`OpenAiChatClient`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint with `response_format = json_object`.
//!
//! Model output is treated as untrusted text; [`parse_events_payload`]
//! recovers the `events` array from fenced, prefixed or otherwise noisy
//! responses and yields an empty list when nothing parses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::PipelineError;
use crate::http::{send_with_retry, RetryPolicy};

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider label recorded in the output document (e.g. `"openai"`).
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    /// Sends one system + user exchange and returns the raw message content.
    async fn complete_json(&self, system: &str, user: &str) -> Result<String>;
}

/// Client for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    retry: RetryPolicy,
}

impl OpenAiChatClient {
    /// # Errors
    ///
    /// [`PipelineError::MissingCredential`] when `api_key` is empty.
    pub fn new(config: &LlmConfig, api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::MissingCredential("OPENAI_API_KEY".to_string()).into());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            provider: config.provider.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            retry: RetryPolicy::new(config.max_retries),
        })
    }

    /// Overrides the model named in config (CLI `--model`).
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let response = send_with_retry("llm", self.retry, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        let json: Value = response
            .json()
            .await
            .context("LLM response body is not JSON")?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                PipelineError::InvalidInput("LLM response has no choices[0].message.content".into())
                    .into()
            })
    }
}

/// System prompt for one source. The schema and the event-count window are
/// the contract the response parser and normalizer rely on.
pub fn extraction_system_prompt(max_events: usize) -> String {
    format!(
        "You extract business events from an evidence digest.\n\
         Return ONLY a JSON object of the form \
         {{\"events\":[{{\"event_id\":string,\"source_key\":string,\"domain\":string,\
         \"title\":string,\"summary\":string,\"evidence\":[string]}}]}}.\n\
         Rules:\n\
         - Produce between 4 and {max} events.\n\
         - Use the given source_key and expected_domain for every event.\n\
         - title: short and specific. summary: at most 2 sentences.\n\
         - evidence: quote concrete lines, numbers, rows or timestamps from the digest \
           (for facts sheets, cite the spike/surge/breach lines).\n\
         - Do not invent facts that are not supported by the digest.",
        max = max_events
    )
}

/// Recovers the `events` array from a model response.
///
/// Tries, in order: the body of a fenced code block (or the whole text),
/// then the outermost `{...}` span. Anything unparseable yields `[]`.
pub fn parse_events_payload(content: &str) -> Vec<Value> {
    let candidate = strip_code_fence(content).unwrap_or(content).trim();

    let parsed = serde_json::from_str::<Value>(candidate).ok().or_else(|| {
        let start = candidate.find('{')?;
        let end = candidate.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str::<Value>(&candidate[start..=end]).ok()
    });

    match parsed {
        Some(Value::Object(mut obj)) => match obj.remove("events") {
            Some(Value::Array(events)) => events,
            _ => Vec::new(),
        },
        Some(Value::Array(events)) => events,
        _ => {
            tracing::warn!(len = content.len(), "model response did not contain parseable JSON");
            Vec::new()
        }
    }
}

/// Returns the inside of the first ``` fenced block, if any.
fn strip_code_fence(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
