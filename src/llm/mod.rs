// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model clients.
//!
//! A [`ModelClient`] dispatches a rendered [`Template`] to the backend named
//! by an allocated [`DriverDescriptor`], in one of three shapes:
//!
//! - `query`: single-shot, run on a blocking worker with a client scoped to
//!   the call.
//! - `squery`: a lazy stream of JSON chunks `{"response", "done"}`.
//! - `aquery`: single-shot on the shared async client.
//!
//! Single-shot results are JSON `{"model", "response", "done": true}`.
//!
//! - [`local`] - Ollama `/api/chat`
//! - [`hosted`] - OpenAI-compatible `/chat/completions` (OpenRouter)

pub mod hosted;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::drivers::{DriverDescriptor, DriverKind};
use crate::prompt::Template;

pub use hosted::{HostedClient, HostedError};
pub use local::{OllamaClient, OllamaError};

/// Lazily produced chunks of model output.
pub type TextStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn query(&self, driver: &DriverDescriptor, template: &Template) -> Result<String>;

    async fn squery(&self, driver: &DriverDescriptor, template: &Template) -> Result<TextStream>;

    async fn aquery(&self, driver: &DriverDescriptor, template: &Template) -> Result<String>;
}

/// Final single-shot payload.
pub fn final_payload(model: &str, response: &str) -> String {
    serde_json::json!({
        "model": model,
        "response": response,
        "done": true,
    })
    .to_string()
}

/// One streamed chunk.
pub fn chunk_payload(response: &str, done: bool) -> String {
    serde_json::json!({
        "response": response,
        "done": done,
    })
    .to_string()
}

struct LineState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
    finished: bool,
}

async fn next_line(mut st: LineState) -> Result<Option<(String, LineState)>> {
    loop {
        if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = st.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            return Ok(Some((line, st)));
        }
        if st.finished {
            let line = String::from_utf8_lossy(&st.buf).trim().to_string();
            st.buf.clear();
            if line.is_empty() {
                return Ok(None);
            }
            return Ok(Some((line, st)));
        }
        match st.bytes.next().await {
            Some(chunk) => st.buf.extend_from_slice(&chunk?),
            None => st.finished = true,
        }
    }
}

/// Split a streamed HTTP body into non-empty, trimmed lines.
pub(crate) fn body_lines(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let state = LineState {
        bytes: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        buf: Vec::new(),
        finished: false,
    };
    stream::try_unfold(state, next_line).boxed()
}

/// Routes each dispatch to the client matching the driver's kind.
#[derive(Debug, Clone)]
pub struct LlmDispatcher {
    local: OllamaClient,
    hosted: HostedClient,
}

impl LlmDispatcher {
    pub fn new(local: OllamaClient, hosted: HostedClient) -> Self {
        Self { local, hosted }
    }

    fn client_for(&self, kind: DriverKind) -> &dyn ModelClient {
        match kind {
            DriverKind::Local => &self.local,
            DriverKind::Hosted => &self.hosted,
        }
    }
}

#[async_trait]
impl ModelClient for LlmDispatcher {
    async fn query(&self, driver: &DriverDescriptor, template: &Template) -> Result<String> {
        self.client_for(driver.kind).query(driver, template).await
    }

    async fn squery(&self, driver: &DriverDescriptor, template: &Template) -> Result<TextStream> {
        self.client_for(driver.kind).squery(driver, template).await
    }

    async fn aquery(&self, driver: &DriverDescriptor, template: &Template) -> Result<String> {
        self.client_for(driver.kind).aquery(driver, template).await
    }
}
