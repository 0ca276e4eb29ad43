// Parameter extraction through an OpenAI-compatible chat completions endpoint.
// The model is asked for a bare JSON object; whatever comes back is handed to
// the pipeline as untrusted input and validated there.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::core::agent::agent_config::OpenAiSettings;
use crate::core::agent::{ParamExtractor, PortError};
use crate::infra::http::retry::is_retryable_status;
use crate::infra::http::send_with_retry;

// Greedy, so nested objects are captured whole.
static JSON_SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("JSON span pattern is valid"));

const SYSTEM_PROMPT: &str = "You turn requests for API data into query parameters. \
Reply with a single JSON object and nothing else.";

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OpenAI API error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse response content")]
    MissingContent,

    #[error("No JSON object in model reply: {0}")]
    NoJson(String),

    #[error("Model reply is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub struct OpenAiExtractor {
    client: Client,
    api_key: String,
    model: String,
    temperature: f32,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiExtractor {
    /// `None` when no API key is configured.
    pub fn from_settings(
        settings: &OpenAiSettings,
        timeout: Duration,
        max_retries: u32,
    ) -> Option<Self> {
        let api_key = settings.api_key.clone().filter(|k| !k.trim().is_empty())?;
        Some(Self {
            client: Client::new(),
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            timeout,
            max_retries,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, query: &str) -> Result<String, ExtractorError> {
        let payload = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(query) },
            ],
        });

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&payload);

        let response = send_with_retry(request, self.max_retries).await?;
        if !response.status().is_success() {
            let status = response.status();
            if is_retryable_status(status) {
                tracing::warn!("OpenAI API still failing after {} retries", self.max_retries);
            }
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response_json: Value = response.json().await?;
        response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or(ExtractorError::MissingContent)
    }
}

fn user_prompt(query: &str) -> String {
    format!(
        "Analyse the user request and produce a structured JSON object for an API query.\n\
         Request: {}\n\
         Reply only with the JSON object containing the keys: limit, fields, filters, description.",
        query
    )
}

/// Pulls the outermost `{...}` span out of a model reply and parses it.
/// Replies often wrap the object in prose or a code fence.
pub fn extract_json(reply: &str) -> Result<Value, ExtractorError> {
    let span = JSON_SPAN_RE
        .find(reply)
        .ok_or_else(|| ExtractorError::NoJson(reply.chars().take(200).collect()))?;
    Ok(serde_json::from_str(span.as_str())?)
}

#[async_trait]
impl ParamExtractor for OpenAiExtractor {
    async fn extract(&self, query: &str) -> Result<Value, PortError> {
        let reply = self.complete(query).await?;
        tracing::debug!("Extractor reply: {}", reply);
        Ok(extract_json(&reply)?)
    }
}
