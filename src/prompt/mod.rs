// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retrieval-augmented prompt orchestration.
//!
//! [`PromptOrchestrator::run`] turns a [`PromptRequest`] into a [`Template`]
//! backed by passages from the session's index, leases a driver from the
//! pool, dispatches in the requested [`DeliveryMode`] and post-processes the
//! result. Every failure past validation is absorbed: translation falls back
//! to the original text, and pool exhaustion or a backend error becomes
//! [`UPSTREAM_FAILURE`].

pub mod template;

use futures_util::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;

use crate::drivers::{DriverLease, DriverPool};
use crate::llm::{ModelClient, TextStream};
use crate::rag::SearchHit;
use crate::session::SessionContext;
use crate::translate::{translate_or_fallback, Translation, Translator};
use crate::types::{DeliveryMode, PromptRequest, Role, PIPELINE_LANG};

pub use template::{Binding, RenderError, Segment, Slot, Template, TemplateMessage};

/// Returned for pool exhaustion and for any backend failure alike.
pub const UPSTREAM_FAILURE: &str = r##"{"response":"#","done":true}"##;

/// Leading system message; contextual facts follow it.
pub const CONTEXT_PREAMBLE: &str = "Given that: ";

/// System message preceding the questions.
pub const QUESTION_PREAMBLE: &str = "Answer the following: ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("invalid prompt: {0}")]
    ValidationFailed(&'static str),
}

/// Result of a prompt run.
#[derive(Debug)]
pub enum PromptOutput {
    Text(String),
    Stream(LeasedStream),
}

impl PromptOutput {
    /// The text of a `Text` output, `None` for streams.
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Stream(_) => None,
        }
    }
}

/// Model output chunks that keep their driver leased until the stream is
/// exhausted or dropped.
///
/// A backend error mid-stream ends the stream with [`UPSTREAM_FAILURE`] as
/// its final item.
pub struct LeasedStream {
    inner: Option<TextStream>,
    lease: Option<DriverLease>,
    emit_failure: bool,
}

impl LeasedStream {
    fn new(inner: TextStream, lease: DriverLease) -> Self {
        Self {
            inner: Some(inner),
            lease: Some(lease),
            emit_failure: false,
        }
    }

    /// A stream of exactly one [`UPSTREAM_FAILURE`] item.
    pub fn failed() -> Self {
        Self {
            inner: None,
            lease: None,
            emit_failure: true,
        }
    }

    /// Whether a driver is still held.
    pub fn holds_driver(&self) -> bool {
        self.lease.is_some()
    }

    fn finish(&mut self) {
        self.inner = None;
        if let Some(lease) = self.lease.take() {
            if let Err(e) = lease.release() {
                tracing::error!("Failed to release driver after stream: {}", e);
            }
        }
    }
}

impl fmt::Debug for LeasedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedStream")
            .field("lease", &self.lease)
            .field("emit_failure", &self.emit_failure)
            .finish_non_exhaustive()
    }
}

impl Stream for LeasedStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        if let Some(inner) = this.inner.as_mut() {
            match inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => return Poll::Ready(Some(chunk)),
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!("Backend stream failed: {:#}", e);
                    this.finish();
                    return Poll::Ready(Some(UPSTREAM_FAILURE.to_string()));
                }
                Poll::Ready(None) => this.finish(),
            }
        }
        if std::mem::take(&mut this.emit_failure) {
            return Poll::Ready(Some(UPSTREAM_FAILURE.to_string()));
        }
        Poll::Ready(None)
    }
}

fn upstream_failure(mode: DeliveryMode) -> PromptOutput {
    match mode {
        DeliveryMode::Stream => PromptOutput::Stream(LeasedStream::failed()),
        DeliveryMode::Sync | DeliveryMode::Async => PromptOutput::Text(UPSTREAM_FAILURE.to_string()),
    }
}

fn finish_lease(lease: DriverLease) {
    if let Err(e) = lease.release() {
        tracing::error!("Failed to release driver: {}", e);
    }
}

/// Single-shot dispatch on a task that owns the lease.
///
/// The descriptor stays busy until the backend call returns, even when the
/// caller is dropped first.
async fn dispatch_detached(
    model: Arc<dyn ModelClient>,
    template: Template,
    lease: DriverLease,
) -> anyhow::Result<String> {
    let worker = tokio::spawn(async move {
        let result = model.query(lease.descriptor(), &template).await;
        finish_lease(lease);
        result
    });
    worker
        .await
        .map_err(|e| anyhow::anyhow!("Dispatch worker failed: {}", e))?
}

pub struct PromptOrchestrator {
    pool: DriverPool,
    translator: Arc<dyn Translator>,
}

impl PromptOrchestrator {
    pub fn new(pool: DriverPool, translator: Arc<dyn Translator>) -> Self {
        Self { pool, translator }
    }

    pub fn pool(&self) -> &DriverPool {
        &self.pool
    }

    /// Run one prompt against a session's context.
    ///
    /// Only validation fails; everything else degrades into the returned
    /// output.
    pub async fn run(
        &self,
        request: PromptRequest,
        context: &SessionContext,
        mode: DeliveryMode,
    ) -> Result<PromptOutput, PromptError> {
        match request.queries.first() {
            None => return Err(PromptError::ValidationFailed("queries must not be empty")),
            Some(first) if first.is_empty() => {
                return Err(PromptError::ValidationFailed("first query must not be empty"))
            }
            Some(_) => {}
        }
        if request.top == 0 {
            return Err(PromptError::ValidationFailed("top must be positive"));
        }

        let lang = request.lang.clone();
        let translate = request.needs_translation();
        let (queries, facts) = if translate {
            (
                self.to_pipeline(request.queries, &lang).await,
                self.to_pipeline(request.context, &lang).await,
            )
        } else {
            (request.queries, request.context)
        };

        let template = self.build_template(&queries, &facts, request.top, context).await;

        let lease = match self.pool.allocate() {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::warn!(session = context.session_id, "No idle driver, returning upstream failure");
                return Ok(upstream_failure(mode));
            }
            Err(e) => {
                tracing::error!(session = context.session_id, "Driver allocation failed: {}", e);
                return Ok(upstream_failure(mode));
            }
        };

        tracing::debug!(
            session = context.session_id,
            driver = lease.descriptor().id,
            mode = ?mode,
            "Dispatching prompt"
        );

        let dispatched = match mode {
            DeliveryMode::Stream => {
                return Ok(match context.model.squery(lease.descriptor(), &template).await {
                    Ok(chunks) => PromptOutput::Stream(LeasedStream::new(chunks, lease)),
                    Err(e) => {
                        tracing::warn!(session = context.session_id, "Stream dispatch failed: {:#}", e);
                        drop(lease);
                        PromptOutput::Stream(LeasedStream::failed())
                    }
                });
            }
            DeliveryMode::Sync => dispatch_detached(Arc::clone(&context.model), template, lease).await,
            DeliveryMode::Async => {
                let result = context.model.aquery(lease.descriptor(), &template).await;
                finish_lease(lease);
                result
            }
        };

        let output = match dispatched {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(session = context.session_id, "Dispatch failed: {:#}", e);
                return Ok(PromptOutput::Text(UPSTREAM_FAILURE.to_string()));
            }
        };

        if !translate {
            return Ok(PromptOutput::Text(output));
        }
        Ok(PromptOutput::Text(self.localize_output(output, &lang).await))
    }

    /// Translate caller texts into the pipeline language, one at a time.
    async fn to_pipeline(&self, texts: Vec<String>, lang: &str) -> Vec<String> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let translated = translate_or_fallback(self.translator.as_ref(), &text, lang, PIPELINE_LANG).await;
            out.push(translated.into_text());
        }
        out
    }

    async fn build_template(
        &self,
        queries: &[String],
        facts: &[String],
        top: usize,
        context: &SessionContext,
    ) -> Template {
        let mut template = Template::new();
        template.push_text(Role::System, CONTEXT_PREAMBLE);
        for fact in facts {
            template.push_text(Role::System, fact.as_str());
        }

        for (index, query) in queries.iter().enumerate() {
            let hits = match context.index.search(query, top).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(session = context.session_id, "Passage search failed: {:#}", e);
                    Vec::new()
                }
            };

            let mut rank = 0;
            for hit in hits.into_iter().take(top) {
                let id = match hit {
                    SearchHit::Exhausted => break,
                    SearchHit::Passage(id) => id,
                };
                match context.index.retrieve(id).await {
                    Ok((_, text)) => {
                        template.push_slot(Role::System, Slot::ContextSnippet { query: index, rank }, text);
                        rank += 1;
                    }
                    Err(e) => {
                        tracing::warn!(session = context.session_id, passage = id, "Passage lookup failed: {:#}", e);
                    }
                }
            }
        }

        template.push_text(Role::System, QUESTION_PREAMBLE);
        for (index, query) in queries.iter().enumerate() {
            template.push_slot(Role::Human, Slot::Query { index }, query.as_str());
        }
        template
    }

    /// Translate the `response` field of a JSON payload back to `lang`.
    /// Anything that is not such a payload, or fails to translate, is
    /// returned unchanged.
    async fn localize_output(&self, output: String, lang: &str) -> String {
        let Ok(mut payload) = serde_json::from_str::<serde_json::Value>(&output) else {
            return output;
        };
        let Some(response) = payload.get("response").and_then(|v| v.as_str()).map(str::to_owned) else {
            return output;
        };

        match translate_or_fallback(self.translator.as_ref(), &response, PIPELINE_LANG, lang).await {
            Translation::Translated(text) => {
                payload["response"] = serde_json::Value::String(text);
                payload.to_string()
            }
            Translation::Fallback { .. } => output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverSeed;
    use crate::drivers::DriverKind;
    use crate::rag::MemoryIndex;
    use crate::test_support::{FailingTranslator, FakeIndex, GatedModel, PrefixTranslator, ScriptedModel};
    use crate::translate::DisabledTranslator;
    use std::time::Duration;

    fn pool(idle: usize) -> DriverPool {
        let pool = DriverPool::open_in_memory().unwrap();
        let seeds: Vec<DriverSeed> = (0..idle)
            .map(|i| DriverSeed::new(format!("http://localhost:{}", 11434 + i), DriverKind::Local))
            .collect();
        pool.seed(&seeds).unwrap();
        pool
    }

    fn context(index: Arc<FakeIndex>, model: Arc<ScriptedModel>) -> SessionContext {
        SessionContext {
            session_id: 1,
            index,
            model,
        }
    }

    fn orchestrator(pool: DriverPool) -> PromptOrchestrator {
        PromptOrchestrator::new(pool, Arc::new(DisabledTranslator))
    }

    fn what_is_x() -> PromptRequest {
        PromptRequest::new(vec!["What is X?".to_string()]).with_top(2)
    }

    fn doc_index() -> Arc<FakeIndex> {
        Arc::new(
            FakeIndex::new()
                .with_hits(vec![SearchHit::Passage(5), SearchHit::Passage(7), SearchHit::Exhausted])
                .with_passage(5, "l", "doc5 text")
                .with_passage(7, "l", "doc7 text"),
        )
    }

    #[test]
    fn test_upstream_failure_shape() {
        let value: serde_json::Value = serde_json::from_str(UPSTREAM_FAILURE).unwrap();
        assert_eq!(value["response"], "#");
        assert_eq!(value["done"], true);
    }

    #[tokio::test]
    async fn test_empty_queries_fail_validation_without_side_effects() {
        let index = doc_index();
        let pool = pool(1);
        let orchestrator = orchestrator(pool.clone());
        let ctx = context(index.clone(), Arc::new(ScriptedModel::text("unused")));

        let err = orchestrator
            .run(PromptRequest::new(vec![]), &ctx, DeliveryMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, PromptError::ValidationFailed(_)));

        let err = orchestrator
            .run(PromptRequest::new(vec![String::new()]), &ctx, DeliveryMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, PromptError::ValidationFailed(_)));

        assert_eq!(index.search_calls(), 0);
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_binds_two_passages_and_query() {
        let pool = pool(1);
        let model = Arc::new(ScriptedModel::text("X is ..."));
        let ctx = context(doc_index(), model.clone());

        let output = orchestrator(pool.clone())
            .run(what_is_x(), &ctx, DeliveryMode::Sync)
            .await
            .unwrap();
        assert_eq!(output.into_text().as_deref(), Some("X is ..."));

        let template = model.last_template().unwrap();
        assert_eq!(template.snippet_count(0), 2);
        let rendered = template.render().unwrap();
        let contents: Vec<&str> = rendered.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![CONTEXT_PREAMBLE, "doc5 text", "doc7 text", QUESTION_PREAMBLE, "What is X?"]
        );
        assert_eq!(rendered.last().unwrap().role, "user");
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_marker_stops_retrieval_early() {
        let index = Arc::new(
            FakeIndex::new()
                .with_hits(vec![SearchHit::Passage(1), SearchHit::Exhausted, SearchHit::Passage(2)])
                .with_passage(1, "l", "one")
                .with_passage(2, "l", "two"),
        );
        let model = Arc::new(ScriptedModel::text("ok"));
        let ctx = context(index.clone(), model.clone());

        orchestrator(pool(1))
            .run(PromptRequest::new(vec!["q".into()]).with_top(3), &ctx, DeliveryMode::Async)
            .await
            .unwrap();

        assert_eq!(model.last_template().unwrap().snippet_count(0), 1);
        assert_eq!(index.retrieve_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_idle_driver_returns_sentinel_after_search() {
        let index = doc_index();
        let model = Arc::new(ScriptedModel::text("X is ..."));
        let ctx = context(index.clone(), model.clone());

        let output = orchestrator(pool(0))
            .run(what_is_x(), &ctx, DeliveryMode::Sync)
            .await
            .unwrap();
        assert_eq!(output.into_text().as_deref(), Some(UPSTREAM_FAILURE));
        assert_eq!(index.search_calls(), 1);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_error_becomes_sentinel_and_releases() {
        let pool = pool(1);
        let ctx = context(doc_index(), Arc::new(ScriptedModel::failing()));

        let output = orchestrator(pool.clone())
            .run(what_is_x(), &ctx, DeliveryMode::Async)
            .await
            .unwrap();
        assert_eq!(output.into_text().as_deref(), Some(UPSTREAM_FAILURE));
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_english_output_is_untouched() {
        let payload = r#"{"model":"m","response":"hello","done":true}"#;
        let orchestrator = PromptOrchestrator::new(pool(1), Arc::new(PrefixTranslator));
        let ctx = context(doc_index(), Arc::new(ScriptedModel::text(payload)));

        let output = orchestrator.run(what_is_x(), &ctx, DeliveryMode::Sync).await.unwrap();
        assert_eq!(output.into_text().as_deref(), Some(payload));
    }

    #[tokio::test]
    async fn test_inputs_and_output_cross_translation_bridge() {
        let payload = r#"{"model":"m","response":"hello","done":true}"#;
        let model = Arc::new(ScriptedModel::text(payload));
        let orchestrator = PromptOrchestrator::new(pool(1), Arc::new(PrefixTranslator));
        let ctx = context(doc_index(), model.clone());

        let request = PromptRequest::new(vec!["hola".into()])
            .with_context(vec!["hecho".into()])
            .with_lang("es");
        let output = orchestrator.run(request, &ctx, DeliveryMode::Async).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(&output.into_text().unwrap()).unwrap();
        assert_eq!(value["response"], "[es] hello");
        assert_eq!(value["model"], "m");

        let rendered = model.last_template().unwrap().render().unwrap();
        assert_eq!(rendered[1].content, "[en] hecho");
        assert_eq!(rendered.last().unwrap().content, "[en] hola");
    }

    #[tokio::test]
    async fn test_failed_back_translation_keeps_english_result() {
        let payload = r#"{"model":"m","response":"hello","done":true}"#;
        let orchestrator = PromptOrchestrator::new(pool(1), Arc::new(FailingTranslator));
        let ctx = context(doc_index(), Arc::new(ScriptedModel::text(payload)));

        let request = what_is_x().with_lang("de");
        let output = orchestrator.run(request, &ctx, DeliveryMode::Sync).await.unwrap();
        assert_eq!(output.into_text().as_deref(), Some(payload));
    }

    #[tokio::test]
    async fn test_non_json_output_skips_back_translation() {
        let orchestrator = PromptOrchestrator::new(pool(1), Arc::new(PrefixTranslator));
        let ctx = context(doc_index(), Arc::new(ScriptedModel::text("plain")));

        let output = orchestrator
            .run(what_is_x().with_lang("fr"), &ctx, DeliveryMode::Sync)
            .await
            .unwrap();
        assert_eq!(output.into_text().as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn test_stream_holds_driver_until_exhausted() {
        let pool = pool(1);
        let model = Arc::new(ScriptedModel::chunks(vec!["a", "b"]));
        let ctx = context(doc_index(), model);

        let output = orchestrator(pool.clone())
            .run(what_is_x(), &ctx, DeliveryMode::Stream)
            .await
            .unwrap();
        let PromptOutput::Stream(mut stream) = output else {
            panic!("expected a stream");
        };
        assert_eq!(pool.idle_count().unwrap(), 0);

        assert_eq!(stream.next().await.as_deref(), Some("a"));
        assert_eq!(pool.idle_count().unwrap(), 0);
        assert_eq!(stream.next().await.as_deref(), Some("b"));
        assert_eq!(stream.next().await, None);
        assert!(!stream.holds_driver());
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_stream_releases_driver() {
        let pool = pool(1);
        let ctx = context(doc_index(), Arc::new(ScriptedModel::chunks(vec!["a", "b", "c"])));

        let output = orchestrator(pool.clone())
            .run(what_is_x(), &ctx, DeliveryMode::Stream)
            .await
            .unwrap();
        let PromptOutput::Stream(mut stream) = output else {
            panic!("expected a stream");
        };
        assert_eq!(stream.next().await.as_deref(), Some("a"));
        drop(stream);
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_error_ends_with_sentinel() {
        let pool = pool(1);
        let ctx = context(doc_index(), Arc::new(ScriptedModel::chunks_then_error(vec!["a"])));

        let output = orchestrator(pool.clone())
            .run(what_is_x(), &ctx, DeliveryMode::Stream)
            .await
            .unwrap();
        let PromptOutput::Stream(stream) = output else {
            panic!("expected a stream");
        };
        let items: Vec<String> = stream.collect().await;
        assert_eq!(items, vec!["a".to_string(), UPSTREAM_FAILURE.to_string()]);
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stream_without_driver_yields_single_sentinel() {
        let ctx = context(doc_index(), Arc::new(ScriptedModel::chunks(vec!["a"])));
        let output = orchestrator(pool(0))
            .run(what_is_x(), &ctx, DeliveryMode::Stream)
            .await
            .unwrap();
        let PromptOutput::Stream(stream) = output else {
            panic!("expected a stream");
        };
        let items: Vec<String> = stream.collect().await;
        assert_eq!(items, vec![UPSTREAM_FAILURE.to_string()]);
    }

    #[tokio::test]
    async fn test_search_failure_degrades_to_no_passages() {
        let model = Arc::new(ScriptedModel::text("ok"));
        let ctx = context(Arc::new(FakeIndex::new().failing_search()), model.clone());

        let output = orchestrator(pool(1))
            .run(what_is_x(), &ctx, DeliveryMode::Sync)
            .await
            .unwrap();
        assert_eq!(output.into_text().as_deref(), Some("ok"));
        assert_eq!(model.last_template().unwrap().snippet_count(0), 0);
    }

    #[tokio::test]
    async fn test_huge_top_is_bounded_by_matching_passages() {
        let index = MemoryIndex::default();
        index.add_text("X is a letter.", "doc");
        let model = Arc::new(ScriptedModel::text("ok"));
        let ctx = SessionContext {
            session_id: 1,
            index: Arc::new(index),
            model: model.clone(),
        };

        let output = orchestrator(pool(1))
            .run(what_is_x().with_top(usize::MAX), &ctx, DeliveryMode::Sync)
            .await
            .unwrap();
        assert_eq!(output.into_text().as_deref(), Some("ok"));
        assert_eq!(model.last_template().unwrap().snippet_count(0), 1);
    }

    #[tokio::test]
    async fn test_dropped_sync_run_keeps_driver_busy_until_backend_returns() {
        let pool = pool(1);
        let model = Arc::new(GatedModel::default());
        let ctx = SessionContext {
            session_id: 1,
            index: Arc::new(FakeIndex::new()),
            model: model.clone(),
        };
        let orchestrator = orchestrator(pool.clone());

        tokio::select! {
            _ = orchestrator.run(what_is_x(), &ctx, DeliveryMode::Sync) => {
                panic!("dispatch finished before the backend replied");
            }
            _ = model.wait_started() => {}
        }

        // The caller is gone but the backend call is still running.
        assert_eq!(pool.idle_count().unwrap(), 0);
        assert!(pool.allocate().unwrap().is_none());

        model.open();
        for _ in 0..200 {
            if pool.idle_count().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(model.finished(), 1);
        assert_eq!(pool.idle_count().unwrap(), 1);
    }
}
