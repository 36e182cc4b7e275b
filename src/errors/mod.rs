// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP-facing errors.
//!
//! Every error response is JSON of the form
//! `{"error": {"error_type", "message", "reference"}, "status"}`. Internal
//! details are logged together with the reference code and never sent to
//! the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::auth::AuthError;
use crate::drivers::PoolError;
use crate::prompt::PromptError;
use crate::session::SessionError;

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ApiError {
    /// Malformed or invalid request (400)
    InvalidRequest { message: String, reference: String },

    /// Missing or invalid session token (401)
    AuthenticationRequired { message: String, reference: String },

    /// Bad access key (403)
    AuthorizationDenied { message: String, reference: String },

    /// Session expired or never existed (410)
    SessionGone { message: String, reference: String },

    /// Session id collision (409)
    Conflict { message: String, reference: String },

    /// Internal server error (500) - NEVER exposes internal details
    InternalError { message: String, reference: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::AuthenticationRequired { .. } => StatusCode::UNAUTHORIZED,
            Self::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            Self::SessionGone { .. } => StatusCode::GONE,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            Self::InvalidRequest { reference, .. }
            | Self::AuthenticationRequired { reference, .. }
            | Self::AuthorizationDenied { reference, .. }
            | Self::SessionGone { reference, .. }
            | Self::Conflict { reference, .. }
            | Self::InternalError { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidRequest { message, .. }
            | Self::AuthenticationRequired { message, .. }
            | Self::AuthorizationDenied { message, .. }
            | Self::SessionGone { message, .. }
            | Self::Conflict { message, .. }
            | Self::InternalError { message, .. } => message,
        }
    }

    pub fn invalid_request(user_message: &str) -> Self {
        let reference = generate_reference_code();
        tracing::debug!(reference = %reference, "Invalid request: {}", user_message);
        Self::InvalidRequest {
            message: sanitize_error_details(user_message),
            reference,
        }
    }

    pub fn authentication_required(internal_reason: &str) -> Self {
        let reference = generate_reference_code();
        tracing::info!(reference = %reference, "Authentication failed: {}", internal_reason);
        Self::AuthenticationRequired {
            message: "A valid session token is required.".to_string(),
            reference,
        }
    }

    pub fn authorization_denied() -> Self {
        let reference = generate_reference_code();
        tracing::warn!(reference = %reference, "Access key rejected");
        Self::AuthorizationDenied {
            message: "Access denied.".to_string(),
            reference,
        }
    }

    pub fn session_gone() -> Self {
        Self::SessionGone {
            message: "Your session has expired. Please authenticate again.".to_string(),
            reference: generate_reference_code(),
        }
    }

    pub fn conflict() -> Self {
        Self::Conflict {
            message: "Session could not be created. Please try again.".to_string(),
            reference: generate_reference_code(),
        }
    }

    /// Log `internal_error` in full; the caller only sees the reference.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, "Internal error: {}", internal_error);
        Self::InternalError {
            message: format!(
                "An unexpected error occurred. Reference: {}",
                reference
            ),
            reference,
        }
    }
}

/// User-facing error response structure (JSON format).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Forbidden => Self::authorization_denied(),
            AuthError::Unauthorized(reason) => Self::authentication_required(reason),
            AuthError::Gone(_) => Self::session_gone(),
            AuthError::Conflict(id) => {
                tracing::warn!(session = id, "Session id collision on issue");
                Self::conflict()
            }
            other => Self::internal_error(&other.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Conflict(_) => Self::conflict(),
            other => Self::internal_error(&other.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        Self::internal_error(&e.to_string())
    }
}

impl From<PromptError> for ApiError {
    fn from(e: PromptError) -> Self {
        Self::invalid_request(&e.to_string())
    }
}

/// Patterns for sanitizing sensitive information from error messages.
static SANITIZE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root)/[^\s]+").expect("Unix path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("IPv4 regex"), "[IP_REDACTED]"),
        (Regex::new(r"sk-or-[a-zA-Z0-9-]{20,}").expect("OpenRouter key regex"), "[API_KEY_REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9-._~+/]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),
        (Regex::new(r"\b[A-Za-z0-9_-]{20,}\.[A-Za-z0-9_-]{20,}\.[A-Za-z0-9_-]{20,}\b").expect("Token regex"), "[TOKEN_REDACTED]"),
    ]
});

/// Remove paths, addresses, keys and tokens from a message shown to callers.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();
    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}
