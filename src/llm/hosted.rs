// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hosted OpenAI-compatible backend (OpenRouter by default).
//!
//! Single-shot calls retry transient failures (network errors, 429, 5xx)
//! with exponential backoff. Streaming uses server-sent events and is not
//! retried once the first byte has arrived.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

use super::{body_lines, chunk_payload, final_payload, ModelClient, TextStream};
use crate::drivers::DriverDescriptor;
use crate::prompt::Template;
use crate::security::mask_secret;
use crate::types::Message;

/// Default timeout for API requests (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Maximum retry attempts for transient errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10000;

/// Error types specific to hosted backends.
#[derive(Debug, Clone)]
pub enum HostedError {
    /// API key not configured.
    NotConfigured(String),
    /// Authentication failed.
    AuthError(String),
    /// Rate limit exceeded.
    RateLimited(String),
    /// Model not found.
    ModelNotFound(String),
    /// API error.
    ApiError(String),
    /// Network error.
    NetworkError(String),
}

impl std::fmt::Display for HostedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured(msg) => write!(f, "Hosted backend not configured: {}", msg),
            Self::AuthError(msg) => write!(f, "Authentication failed: {}", msg),
            Self::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            Self::ModelNotFound(model) => write!(f, "Model not found: {}", model),
            Self::ApiError(msg) => write!(f, "Hosted API error: {}", msg),
            Self::NetworkError(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for HostedError {}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Outcome of a failed attempt.
enum Attempt {
    Retry(HostedError),
    Fail(HostedError),
}

fn classify_status(status: reqwest::StatusCode, error_text: &str, model: &str) -> Attempt {
    let code = status.as_u16();
    match code {
        401 => Attempt::Fail(HostedError::AuthError("Invalid API key.".to_string())),
        402 => Attempt::Fail(HostedError::ApiError("Insufficient credits.".to_string())),
        404 => Attempt::Fail(HostedError::ModelNotFound(model.to_string())),
        429 => Attempt::Retry(HostedError::RateLimited("Too many requests.".to_string())),
        500..=599 => Attempt::Retry(HostedError::ApiError(format!(
            "Server error: HTTP {} - {}",
            status, error_text
        ))),
        _ => Attempt::Fail(HostedError::ApiError(format!(
            "API error: HTTP {} - {}",
            status, error_text
        ))),
    }
}

fn network_error(e: &reqwest::Error) -> HostedError {
    if e.is_timeout() {
        HostedError::NetworkError("Request timed out.".to_string())
    } else if e.is_connect() {
        HostedError::NetworkError(format!("Failed to connect: {}", e))
    } else {
        HostedError::NetworkError(format!("Network error: {}", e))
    }
}

/// Exponential backoff: 1000ms, 2000ms, ... capped at 10s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(std::cmp::min(
        RETRY_BASE_DELAY_MS * (1 << attempt),
        RETRY_MAX_DELAY_MS,
    ))
}

fn completion_text(response: ChatCompletionResponse, model: &str) -> (String, String) {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    (response.model.unwrap_or_else(|| model.to_string()), text)
}

/// Parse one SSE line into a chunk payload. Comments and empty deltas yield
/// nothing.
fn parse_event_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let event: StreamEvent =
        serde_json::from_str(data.trim()).context("Malformed stream event from hosted backend")?;
    if let Some(error) = event.error {
        return Err(anyhow!(HostedError::ApiError(error.to_string())));
    }
    Ok(event
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(|text| chunk_payload(&text, false)))
}

fn is_done_marker(line: &str) -> bool {
    line.strip_prefix("data:").map(str::trim) == Some("[DONE]")
}

/// Client for OpenAI-compatible chat-completion endpoints.
#[derive(Debug, Clone)]
pub struct HostedClient {
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HostedClient {
    pub fn new(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the client is configured with an API key.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get the API key (for display purposes - masked).
    pub fn api_key_masked(&self) -> Option<String> {
        self.api_key.as_deref().map(mask_secret)
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow!(HostedError::NotConfigured(
                "API key is not set.".to_string()
            ))
        })
    }

    fn completions_url(driver: &DriverDescriptor) -> String {
        format!("{}/chat/completions", driver.uri.trim_end_matches('/'))
    }

    fn chat_body(&self, template: &Template, stream: bool) -> Result<serde_json::Value> {
        let messages: Vec<Message> = template.render()?;
        Ok(serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        }))
    }
}

#[async_trait]
impl ModelClient for HostedClient {
    async fn query(&self, driver: &DriverDescriptor, template: &Template) -> Result<String> {
        let api_key = self.api_key()?.to_string();
        let url = Self::completions_url(driver);
        let body = self.chat_body(template, false)?;
        let model = self.model.clone();
        let timeout = self.timeout;

        let (model, text) = tokio::task::spawn_blocking(move || -> Result<(String, String)> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?;

            let mut last_error = None;
            for attempt in 0..MAX_RETRIES {
                if attempt > 0 {
                    let delay = backoff_delay(attempt);
                    tracing::debug!("Retry attempt {} after {}ms delay", attempt + 1, delay.as_millis());
                    std::thread::sleep(delay);
                }

                let response = match client.post(&url).bearer_auth(&api_key).json(&body).send() {
                    Ok(resp) => resp,
                    Err(e) => {
                        last_error = Some(network_error(&e));
                        continue;
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let error_text = response.text().unwrap_or_default();
                    match classify_status(status, &error_text, &model) {
                        Attempt::Retry(err) => {
                            last_error = Some(err);
                            continue;
                        }
                        Attempt::Fail(err) => return Err(anyhow!(err)),
                    }
                }

                let completion: ChatCompletionResponse =
                    response.json().context("Failed to parse chat response")?;
                return Ok(completion_text(completion, &model));
            }

            Err(anyhow!(last_error.unwrap_or_else(|| HostedError::ApiError(
                "Max retries exceeded".to_string()
            ))))
        })
        .await
        .context("Chat worker panicked")??;

        Ok(final_payload(&model, &text))
    }

    async fn squery(&self, driver: &DriverDescriptor, template: &Template) -> Result<TextStream> {
        let api_key = self.api_key()?;
        let body = self.chat_body(template, true)?;
        let response = self
            .client
            .post(Self::completions_url(driver))
            .bearer_auth(api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| anyhow!(network_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match classify_status(status, &error_text, &self.model) {
                Attempt::Retry(err) | Attempt::Fail(err) => anyhow!(err),
            });
        }

        let chunks = body_lines(response)
            .take_while(|line| future::ready(!matches!(line, Ok(l) if is_done_marker(l))))
            .filter_map(|line| {
                future::ready(match line {
                    Ok(l) => parse_event_line(&l).transpose(),
                    Err(e) => Some(Err(e)),
                })
            })
            .chain(stream::once(future::ready(Ok(chunk_payload("", true)))));
        Ok(chunks.boxed())
    }

    async fn aquery(&self, driver: &DriverDescriptor, template: &Template) -> Result<String> {
        let api_key = self.api_key()?;
        let url = Self::completions_url(driver);
        let body = self.chat_body(template, false)?;

        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                tracing::debug!("Retry attempt {} after {}ms delay", attempt + 1, delay.as_millis());
                sleep(delay).await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&body)
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(network_error(&e));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                match classify_status(status, &error_text, &self.model) {
                    Attempt::Retry(err) => {
                        last_error = Some(err);
                        continue;
                    }
                    Attempt::Fail(err) => return Err(anyhow!(err)),
                }
            }

            let completion: ChatCompletionResponse = response
                .json()
                .await
                .context("Failed to parse chat response")?;
            let (model, text) = completion_text(completion, &self.model);
            return Ok(final_payload(&model, &text));
        }

        Err(anyhow!(last_error.unwrap_or_else(|| HostedError::ApiError(
            "Max retries exceeded".to_string()
        ))))
    }
}
