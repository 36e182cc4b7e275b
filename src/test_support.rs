// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fakes shared by unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::drivers::DriverDescriptor;
use crate::llm::{ModelClient, TextStream};
use crate::prompt::Template;
use crate::rag::{Indexer, PassageId, SearchHit};
use crate::session::{Clock, ContextFactory, SessionContext};
use crate::translate::{TranslationError, Translator};
use crate::types::{DocumentSubmission, SessionId};

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_now() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Index returning the same scripted hits for every query.
#[derive(Default)]
pub struct FakeIndex {
    hits: Vec<SearchHit>,
    passages: HashMap<PassageId, (String, String)>,
    fail_search: bool,
    added: Mutex<Vec<(DocumentSubmission, String)>>,
    searches: AtomicUsize,
    retrievals: AtomicUsize,
}

impl FakeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits(mut self, hits: Vec<SearchHit>) -> Self {
        self.hits = hits;
        self
    }

    pub fn with_passage(mut self, id: PassageId, label: &str, text: &str) -> Self {
        self.passages.insert(id, (label.to_string(), text.to_string()));
        self
    }

    pub fn failing_search(mut self) -> Self {
        self.fail_search = true;
        self
    }

    pub fn search_calls(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrievals.load(Ordering::SeqCst)
    }

    pub fn added(&self) -> Vec<(DocumentSubmission, String)> {
        self.added.lock().unwrap().clone()
    }
}

#[async_trait]
impl Indexer for FakeIndex {
    async fn add(&self, source: DocumentSubmission, label: &str) -> Result<usize> {
        self.added.lock().unwrap().push((source, label.to_string()));
        Ok(1)
    }

    async fn search(&self, _query: &str, top: usize) -> Result<Vec<SearchHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_search {
            return Err(anyhow!("index unavailable"));
        }
        Ok(self.hits.iter().copied().take(top).collect())
    }

    async fn retrieve(&self, id: PassageId) -> Result<(String, String)> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        self.passages
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no passage {}", id))
    }
}

enum Reply {
    Text(String),
    Fail,
    Chunks { chunks: Vec<String>, then_error: bool },
}

/// Model client with a fixed reply that records what it was sent.
pub struct ScriptedModel {
    reply: Reply,
    last: Mutex<Option<Template>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::with_reply(Reply::Text(text.to_string()))
    }

    pub fn failing() -> Self {
        Self::with_reply(Reply::Fail)
    }

    pub fn chunks(chunks: Vec<&str>) -> Self {
        Self::with_reply(Reply::Chunks {
            chunks: chunks.into_iter().map(String::from).collect(),
            then_error: false,
        })
    }

    pub fn chunks_then_error(chunks: Vec<&str>) -> Self {
        Self::with_reply(Reply::Chunks {
            chunks: chunks.into_iter().map(String::from).collect(),
            then_error: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_template(&self) -> Option<Template> {
        self.last.lock().unwrap().clone()
    }

    fn record(&self, template: &Template) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(template.clone());
    }

    fn single(&self, template: &Template) -> Result<String> {
        self.record(template);
        match &self.reply {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail => Err(anyhow!("backend down")),
            Reply::Chunks { chunks, .. } => Ok(chunks.concat()),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn query(&self, _driver: &DriverDescriptor, template: &Template) -> Result<String> {
        self.single(template)
    }

    async fn squery(&self, _driver: &DriverDescriptor, template: &Template) -> Result<TextStream> {
        self.record(template);
        match &self.reply {
            Reply::Text(text) => Ok(stream::iter(vec![Ok(text.clone())]).boxed()),
            Reply::Fail => Err(anyhow!("backend down")),
            Reply::Chunks { chunks, then_error } => {
                let mut items: Vec<Result<String>> = chunks.iter().cloned().map(Ok).collect();
                if *then_error {
                    items.push(Err(anyhow!("connection reset")));
                    items.push(Ok("never seen".to_string()));
                }
                Ok(stream::iter(items).boxed())
            }
        }
    }

    async fn aquery(&self, _driver: &DriverDescriptor, template: &Template) -> Result<String> {
        self.single(template)
    }
}

/// Model whose single-shot replies wait for [`GatedModel::open`].
#[derive(Default)]
pub struct GatedModel {
    started: Notify,
    gate: Notify,
    finished: AtomicUsize,
}

impl GatedModel {
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn open(&self) {
        self.gate.notify_one();
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    async fn reply(&self) -> Result<String> {
        self.started.notify_one();
        self.gate.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok("late".to_string())
    }
}

#[async_trait]
impl ModelClient for GatedModel {
    async fn query(&self, _driver: &DriverDescriptor, _template: &Template) -> Result<String> {
        self.reply().await
    }

    async fn squery(&self, _driver: &DriverDescriptor, _template: &Template) -> Result<TextStream> {
        Err(anyhow!("not streaming"))
    }

    async fn aquery(&self, _driver: &DriverDescriptor, _template: &Template) -> Result<String> {
        self.reply().await
    }
}

/// Always fails.
pub struct FailingTranslator;

#[async_trait]
impl Translator for FailingTranslator {
    async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, TranslationError> {
        Err(TranslationError::Payload)
    }
}

/// Prefixes the text with the target language: `[en] text`.
pub struct PrefixTranslator;

#[async_trait]
impl Translator for PrefixTranslator {
    async fn translate(
        &self,
        text: &str,
        _source: &str,
        target: &str,
    ) -> Result<String, TranslationError> {
        Ok(format!("[{}] {}", target, text))
    }
}

/// Builds contexts backed by an empty [`FakeIndex`] and a model answering
/// `"ok"`.
pub fn fake_factory() -> Arc<dyn ContextFactory> {
    Arc::new(|session_id: SessionId| SessionContext {
        session_id,
        index: Arc::new(FakeIndex::new()),
        model: Arc::new(ScriptedModel::text("ok")),
    })
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_http(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
