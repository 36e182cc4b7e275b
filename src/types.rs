// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across ragserve.
//!
//! This module provides unified type definitions shared by the session,
//! prompt and server layers.

use serde::{Deserialize, Serialize};

/// Session identifier. Always in `0..=auth::MAX_SESSION_ID`.
pub type SessionId = i64;

/// Language tag of the English-only pipeline.
pub const PIPELINE_LANG: &str = "en";

/// Role of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Human,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human => "human",
            Self::Assistant => "assistant",
        }
    }

    /// Role name understood by chat-completion backends.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A chat message with role and content, as sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn from_role(role: Role, content: impl Into<String>) -> Self {
        Self::new(role.wire_name(), content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::from_role(Role::Human, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::from_role(Role::System, content)
    }
}

/// A document to add to a session's index. Exactly one source is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSubmission {
    Url(String),
    InlineContent(String),
}

impl DocumentSubmission {
    /// Label stored alongside the passages of this document.
    pub fn label(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::InlineContent(_) => "inline",
        }
    }
}

/// Wire form of a document upload: `{"url": ..}` or `{"content": ..}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentUpload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl TryFrom<DocumentUpload> for DocumentSubmission {
    type Error = &'static str;

    fn try_from(upload: DocumentUpload) -> Result<Self, Self::Error> {
        match (upload.url, upload.content) {
            (Some(url), None) if !url.trim().is_empty() => Ok(Self::Url(url)),
            (None, Some(content)) if !content.trim().is_empty() => {
                Ok(Self::InlineContent(content))
            }
            (Some(_), Some(_)) => Err("exactly one of `url` or `content` must be set"),
            _ => Err("document must carry a non-empty `url` or `content`"),
        }
    }
}

fn default_top() -> usize {
    1
}

fn default_lang() -> String {
    PIPELINE_LANG.to_string()
}

/// A prompt submitted against a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default = "default_top")]
    pub top: usize,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub stream: bool,
}

impl PromptRequest {
    pub fn new(queries: Vec<String>) -> Self {
        Self {
            queries,
            context: Vec::new(),
            top: default_top(),
            lang: default_lang(),
            stream: false,
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_top(mut self, top: usize) -> Self {
        self.top = top;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Whether inputs and outputs cross the translation bridge.
    pub fn needs_translation(&self) -> bool {
        self.lang != PIPELINE_LANG
    }
}

/// How the orchestrator delivers the model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// One text result from a blocking single-shot dispatch.
    Sync,
    /// A lazy sequence of partial text chunks.
    Stream,
    /// One text result from an awaited dispatch.
    Async,
}

impl DeliveryMode {
    /// Parse a mode name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sync" => Some(Self::Sync),
            "stream" => Some(Self::Stream),
            "async" => Some(Self::Async),
            _ => None,
        }
    }
}
