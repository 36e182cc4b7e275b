// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API server
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with session and pool counts
//! - `GET /sales/api/rest/v1/auth?key=..` - Exchange the access key for a
//!   session token
//! - `GET /sales/api/rest/v1/doc` - The caller's session id
//! - `POST /sales/api/rest/v1/doc` - Index a document (`{"url"}` or
//!   `{"content"}`) into the caller's session
//! - `GET|POST /sales/api/rest/v1/prompt?mode=sync|async|stream` - Run a
//!   prompt; stream mode answers with newline-delimited JSON
//! - `DELETE /sales/api/rest/v1/session` - End the caller's session
//!
//! Every route under the base path except `/auth` requires
//! `Authorization: Bearer <token>`.
//!
//! # Example
//!
//! ```no_run
//! use ragserve::config::Config;
//! use ragserve::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(Config::default());
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Extension, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::timeout::TimeoutLayer;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::drivers::DriverPool;
use crate::errors::ApiError;
use crate::llm::{HostedClient, LlmDispatcher, ModelClient, OllamaClient};
use crate::prompt::{PromptOrchestrator, PromptOutput};
use crate::rag::MemoryIndex;
use crate::session::{ContextFactory, SessionContext, SessionRegistry, SessionStore};
use crate::translate::{DisabledTranslator, HttpTranslator, Translator};
use crate::types::{DeliveryMode, DocumentSubmission, DocumentUpload, PromptRequest, SessionId};

/// Base path of the session API.
pub const API_BASE: &str = "/sales/api/rest/v1";

/// Maximum request body size (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Upper bound on producing a response. Streaming bodies are not covered
/// once their headers are sent.
const REQUEST_TIMEOUT_SECS: u64 = 330;

/// Server state shared across handlers.
pub struct AppState {
    pub auth: Authenticator,
    pub sessions: Arc<SessionStore>,
    pub orchestrator: PromptOrchestrator,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(auth: Authenticator, orchestrator: PromptOrchestrator) -> Self {
        Self {
            sessions: Arc::clone(auth.sessions()),
            auth,
            orchestrator,
        }
    }

    pub fn pool(&self) -> &DriverPool {
        self.orchestrator.pool()
    }

    /// Open both stores, seed and reset the driver pool, and wire the
    /// production index, model and translation clients.
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = DriverPool::open(&config.llm_drivers_db_path).with_context(|| {
            format!(
                "Failed to open driver pool at {}",
                config.llm_drivers_db_path.display()
            )
        })?;
        pool.seed(&config.drivers)?;
        pool.reset_all()?;

        let dispatcher = LlmDispatcher::new(
            OllamaClient::new(&config.local_model),
            HostedClient::new(&config.hosted_model, config.hosted_api_key.clone()),
        );
        let factory = Arc::new(DefaultContextFactory::new(
            reqwest::Client::new(),
            Arc::new(dispatcher),
        ));
        let registry = Arc::new(SessionRegistry::new(factory));
        let sessions = SessionStore::open(
            &config.sessions_db_path,
            config.session_lifetime(),
            registry,
        )
        .with_context(|| {
            format!(
                "Failed to open session store at {}",
                config.sessions_db_path.display()
            )
        })?;

        let translator: Arc<dyn Translator> = match &config.translator_url {
            Some(url) => Arc::new(HttpTranslator::new(url)),
            None => {
                tracing::info!("No translator configured; non-English prompts pass through untranslated");
                Arc::new(DisabledTranslator)
            }
        };

        let auth = Authenticator::new(
            &config.auth_key,
            &config.secret_key,
            &config.issuer,
            Arc::new(sessions),
        );
        Ok(Self::new(auth, PromptOrchestrator::new(pool, translator)))
    }
}

/// Gives every new session an empty [`MemoryIndex`] and the shared model
/// dispatcher.
pub struct DefaultContextFactory {
    http: reqwest::Client,
    model: Arc<dyn ModelClient>,
}

impl DefaultContextFactory {
    pub fn new(http: reqwest::Client, model: Arc<dyn ModelClient>) -> Self {
        Self { http, model }
    }
}

impl ContextFactory for DefaultContextFactory {
    fn build(&self, session_id: SessionId) -> SessionContext {
        SessionContext {
            session_id,
            index: Arc::new(MemoryIndex::new(self.http.clone())),
            model: Arc::clone(&self.model),
        }
    }
}

/// Session id of an authenticated caller, set by the auth middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerSession(pub SessionId);

/// Build the router with all routes.
///
/// Rate limiting keys on the client address, so the router must then be
/// served with connect info.
pub fn build_router(state: SharedState, rate_limit: bool) -> Router {
    let protected = Router::new()
        .route("/doc", get(doc_get_handler).post(doc_post_handler))
        .route("/prompt", get(prompt_handler).post(prompt_handler))
        .route("/session", delete(session_delete_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let api = Router::new()
        .route("/auth", get(auth_handler))
        .merge(protected);

    let router = Router::new()
        .route("/health", get(health_handler))
        .nest(API_BASE, api)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state);

    if !rate_limit {
        return router;
    }

    // 60 requests per minute per IP, bursts of 60
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(1)
        .burst_size(60)
        .key_extractor(SmartIpKeyExtractor)
        .finish();
    match governor_conf {
        Some(config) => router.layer(GovernorLayer {
            config: Arc::new(config),
        }),
        None => {
            tracing::warn!("Invalid rate limit configuration, serving without rate limiting");
            router
        }
    }
}

/// API server.
#[derive(Debug)]
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Start the server with graceful shutdown.
    pub async fn start(self) -> Result<()> {
        let state = Arc::new(AppState::from_config(&self.config)?);
        let router = build_router(state, self.config.rate_limit_enabled);
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);

        tracing::info!("Starting server on {}", addr);

        if self.config.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Stop the other instance or pick another port with --port <PORT>",
                    self.config.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

async fn require_session(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::authentication_required("missing bearer token"))?;

    let session_id = state.auth.validate(&token)?;
    request.extensions_mut().insert(CallerSession(session_id));
    Ok(next.run(request).await)
}

fn live_context(state: &AppState, id: SessionId) -> Result<Arc<SessionContext>, ApiError> {
    state.sessions.context(id)?.ok_or_else(ApiError::session_gone)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub live_sessions: usize,
    pub idle_drivers: usize,
    pub total_drivers: usize,
}

async fn health_handler(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let live_sessions = state.sessions.live_sessions()?.len();
    let idle_drivers = state.pool().idle_count()?;
    let total_drivers = state.pool().descriptors()?.len();

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_sessions,
        idle_drivers,
        total_drivers,
    }))
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    key: Option<String>,
}

async fn auth_handler(
    State(state): State<SharedState>,
    Query(query): Query<AuthQuery>,
) -> Result<String, ApiError> {
    let Some(key) = query.key else {
        return Err(ApiError::authorization_denied());
    };
    let issued = state.auth.issue(&key)?;
    Ok(issued.token)
}

async fn doc_get_handler(Extension(CallerSession(id)): Extension<CallerSession>) -> String {
    id.to_string()
}

async fn doc_post_handler(
    State(state): State<SharedState>,
    Extension(CallerSession(id)): Extension<CallerSession>,
    payload: Result<Json<DocumentUpload>, JsonRejection>,
) -> Result<&'static str, ApiError> {
    let Json(upload) = payload.map_err(|e| ApiError::invalid_request(&e.body_text()))?;
    let submission = DocumentSubmission::try_from(upload).map_err(ApiError::invalid_request)?;
    let context = live_context(&state, id)?;

    let label = submission.label().to_string();
    let added = context
        .index
        .add(submission, &label)
        .await
        .map_err(|e| ApiError::invalid_request(&format!("Could not index document: {:#}", e)))?;

    tracing::info!(session = id, passages = added, "Document indexed");
    Ok("OK")
}

#[derive(Debug, Deserialize)]
struct PromptQuery {
    mode: Option<String>,
}

/// Explicit `mode` wins; otherwise the request's `stream` flag picks
/// between stream and async.
fn resolve_mode(param: Option<&str>, request: &PromptRequest) -> Result<DeliveryMode, ApiError> {
    match param {
        Some(name) => DeliveryMode::parse(name).ok_or_else(|| {
            ApiError::invalid_request("mode must be one of sync, async, stream")
        }),
        None if request.stream => Ok(DeliveryMode::Stream),
        None => Ok(DeliveryMode::Async),
    }
}

async fn prompt_handler(
    State(state): State<SharedState>,
    Extension(CallerSession(id)): Extension<CallerSession>,
    Query(query): Query<PromptQuery>,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::invalid_request(&e.body_text()))?;
    let mode = resolve_mode(query.mode.as_deref(), &request)?;
    let context = live_context(&state, id)?;

    tracing::debug!(
        session = id,
        queries = request.queries.len(),
        top = request.top,
        lang = %request.lang,
        mode = ?mode,
        "Prompt received"
    );

    match state.orchestrator.run(request, &context, mode).await? {
        PromptOutput::Text(text) => Ok(text.into_response()),
        PromptOutput::Stream(chunks) => {
            let body = Body::from_stream(
                chunks.map(|chunk| Ok::<_, Infallible>(format!("{}\n", chunk))),
            );
            Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
        }
    }
}

async fn session_delete_handler(
    State(state): State<SharedState>,
    Extension(CallerSession(id)): Extension<CallerSession>,
) -> Result<StatusCode, ApiError> {
    state.sessions.invalidate(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM (Ctrl+C only on non-Unix platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::error!("Failed to install signal handlers, falling back to Ctrl+C");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;

    tracing::info!("Shutting down server");
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown..."),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
