// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ollama backend.
//!
//! Talks to `POST {uri}/api/chat` on the driver allocated for the call.
//! Streaming responses are newline-delimited JSON objects of the form
//! `{"message": {"content": ..}, "done": ..}`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;

use super::{body_lines, chunk_payload, final_payload, ModelClient, TextStream};
use crate::drivers::DriverDescriptor;
use crate::prompt::Template;
use crate::types::Message;

/// Default timeout for generation requests (in seconds).
const GENERATION_TIMEOUT_SECS: u64 = 300;

/// Error types specific to Ollama operations.
#[derive(Debug, Clone)]
pub enum OllamaError {
    /// Ollama server is not running or unreachable.
    NotRunning(String),
    /// Connection timed out.
    Timeout(String),
    /// The requested model was not found.
    ModelNotFound(String),
    /// API error from Ollama.
    ApiError(String),
    /// Network or HTTP error.
    NetworkError(String),
}

impl std::fmt::Display for OllamaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning(msg) => write!(f, "Ollama is not running: {}", msg),
            Self::Timeout(msg) => write!(f, "Request timed out: {}", msg),
            Self::ModelNotFound(model) => write!(f, "Model not found: {}", model),
            Self::ApiError(msg) => write!(f, "Ollama API error: {}", msg),
            Self::NetworkError(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for OllamaError {}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl ChatResponse {
    fn into_text(self, model: &str) -> Result<(String, bool)> {
        if let Some(error) = self.error {
            if error.contains("not found") {
                return Err(anyhow!(OllamaError::ModelNotFound(model.to_string())));
            }
            return Err(anyhow!(OllamaError::ApiError(error)));
        }
        let text = self.message.map(|m| m.content).unwrap_or_default();
        Ok((text, self.done))
    }
}

fn send_error(e: reqwest::Error, uri: &str, timeout: Duration) -> anyhow::Error {
    if e.is_connect() {
        anyhow!(OllamaError::NotRunning(format!(
            "Cannot connect to Ollama at {}",
            uri
        )))
    } else if e.is_timeout() {
        anyhow!(OllamaError::Timeout(format!(
            "Chat request timed out after {} seconds",
            timeout.as_secs()
        )))
    } else {
        anyhow!(OllamaError::NetworkError(e.to_string()))
    }
}

fn status_error(status: reqwest::StatusCode, error_text: &str, model: &str) -> anyhow::Error {
    if status.as_u16() == 404 || error_text.contains("not found") {
        return anyhow!(OllamaError::ModelNotFound(model.to_string()));
    }
    anyhow!(OllamaError::ApiError(format!(
        "Chat failed: HTTP {} - {}",
        status, error_text
    )))
}

/// Client for a pool of Ollama instances sharing one model name.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    model: String,
    client: reqwest::Client,
    generation_timeout: Duration,
}

impl OllamaClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            client: reqwest::Client::new(),
            generation_timeout: Duration::from_secs(GENERATION_TIMEOUT_SECS),
        }
    }

    /// Set the generation timeout.
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(driver: &DriverDescriptor) -> String {
        format!("{}/api/chat", driver.uri.trim_end_matches('/'))
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
impl ModelClient for OllamaClient {
    async fn query(&self, driver: &DriverDescriptor, template: &Template) -> Result<String> {
        let url = Self::chat_url(driver);
        let body = self.chat_body(template, false)?;
        let model = self.model.clone();
        let uri = driver.uri.clone();
        let timeout = self.generation_timeout;

        let text = tokio::task::spawn_blocking(move || -> Result<String> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?;
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .map_err(|e| send_error(e, &uri, timeout))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().unwrap_or_default();
                return Err(status_error(status, &error_text, &model));
            }
            let chat: ChatResponse = response.json().context("Failed to parse chat response")?;
            Ok(chat.into_text(&model)?.0)
        })
        .await
        .context("Chat worker panicked")??;

        Ok(final_payload(&self.model, &text))
    }

    async fn squery(&self, driver: &DriverDescriptor, template: &Template) -> Result<TextStream> {
        let body = self.chat_body(template, true)?;
        let response = self
            .client
            .post(Self::chat_url(driver))
            .json(&body)
            .timeout(self.generation_timeout)
            .send()
            .await
            .map_err(|e| send_error(e, &driver.uri, self.generation_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &error_text, &self.model));
        }

        let model = self.model.clone();
        let chunks = body_lines(response).map(move |line: Result<String>| -> Result<String> {
            let chunk: ChatResponse =
                serde_json::from_str(&line?).context("Malformed stream chunk from Ollama")?;
            let (text, done) = chunk.into_text(&model)?;
            Ok(chunk_payload(&text, done))
        });
        Ok(chunks.boxed())
    }

    async fn aquery(&self, driver: &DriverDescriptor, template: &Template) -> Result<String> {
        let body = self.chat_body(template, false)?;
        let response = self
            .client
            .post(Self::chat_url(driver))
            .json(&body)
            .timeout(self.generation_timeout)
            .send()
            .await
            .map_err(|e| send_error(e, &driver.uri, self.generation_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &error_text, &self.model));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat response")?;
        let (text, _) = chat.into_text(&self.model)?;
        Ok(final_payload(&self.model, &text))
    }
}
