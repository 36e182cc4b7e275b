// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Machine translation between callers and the English-only pipeline.
//!
//! Translation is always best-effort. [`translate_or_fallback`] turns every
//! failure into [`Translation::Fallback`] carrying the untranslated text, so
//! callers decide explicitly what a degraded result means for them.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Longest input sent to a translator, in characters.
pub const MAX_TRANSLATION_CHARS: usize = 4999;

const TRANSLATE_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("no translator configured")]
    Disabled,
    #[error("translator request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("translator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("translator returned an unexpected payload")]
    Payload,
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source: &str, target: &str)
        -> Result<String, TranslationError>;
}

/// Outcome of a best-effort translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    Translated(String),
    /// The original text, returned because translation failed.
    Fallback { original: String, reason: String },
}

impl Translation {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Translated(text) => text,
            Self::Fallback { original, .. } => original,
        }
    }
}

/// First `max` characters of `text`, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Translate `text` (truncated to [`MAX_TRANSLATION_CHARS`]), falling back to
/// the untruncated original on any failure.
pub async fn translate_or_fallback(
    translator: &dyn Translator,
    text: &str,
    source: &str,
    target: &str,
) -> Translation {
    let input = truncate_chars(text, MAX_TRANSLATION_CHARS);
    match translator.translate(input, source, target).await {
        Ok(translated) => Translation::Translated(translated),
        Err(e) => {
            tracing::debug!(source, target, error = %e, "Translation degraded, keeping original");
            Translation::Fallback {
                original: text.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Used when no translation backend is configured. Every call fails, so
/// every caller takes the fallback path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTranslator;

#[async_trait]
impl Translator for DisabledTranslator {
    async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, TranslationError> {
        Err(TranslationError::Disabled)
    }
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// LibreTranslate-compatible client: `POST {base}/translate`.
#[derive(Debug, Clone)]
pub struct HttpTranslator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslationError> {
        let url = format!("{}/translate", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "q": text,
                "source": source,
                "target": target,
                "format": "text",
            }))
            .timeout(Duration::from_secs(TRANSLATE_TIMEOUT_SECS))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|_| TranslationError::Payload)?;
        Ok(body.translated_text)
    }
}
