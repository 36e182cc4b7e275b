// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! ragserve - session-scoped retrieval-augmented prompting service
//!
//! Callers exchange an access key for a session token, upload documents into
//! a private per-session index, and run prompts that are answered by a
//! shared pool of interchangeable model backends.
//!
//! # Core Modules
//!
//! - [`session`] - Persisted sessions with lazy expiry and their private contexts
//! - [`drivers`] - Pool of model backends with atomic allocate/release
//! - [`prompt`] - Retrieval, templating, dispatch and translation round-trip
//! - [`auth`] - HS512 session tokens
//! - [`rag`] - Document indexing and passage retrieval
//! - [`llm`] - Ollama and OpenAI-compatible model clients
//! - [`translate`] - Best-effort machine translation
//! - [`server`] - HTTP API
//! - [`errors`] - HTTP error responses with reference codes

pub mod auth;
pub mod config;
pub mod drivers;
pub mod errors;
pub mod llm;
pub mod prompt;
pub mod rag;
pub mod security;
pub mod server;
pub mod session;
pub mod translate;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{AuthError, Authenticator, IssuedToken, MAX_SESSION_ID};
pub use config::{Config, DriverSeed};
pub use drivers::{DriverDescriptor, DriverKind, DriverLease, DriverPool, PoolError};
pub use prompt::{PromptError, PromptOrchestrator, PromptOutput, UPSTREAM_FAILURE};
pub use session::{SessionContext, SessionError, SessionRegistry, SessionStore};
pub use types::{DeliveryMode, DocumentSubmission, PromptRequest, SessionId};
