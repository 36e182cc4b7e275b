// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide map from session id to its private RAG context.
//!
//! Entries are only ever installed or removed by [`super::SessionStore`],
//! while it holds its connection lock, so the map moves in lockstep with
//! the `sessions` table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::llm::ModelClient;
use crate::rag::Indexer;
use crate::security::{resilient_read, resilient_write};
use crate::types::SessionId;

/// The private retrieval state of one session.
pub struct SessionContext {
    pub session_id: SessionId,
    pub index: Arc<dyn Indexer>,
    pub model: Arc<dyn ModelClient>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Builds a fresh context for a newly created session.
pub trait ContextFactory: Send + Sync {
    fn build(&self, session_id: SessionId) -> SessionContext;
}

impl<F> ContextFactory for F
where
    F: Fn(SessionId) -> SessionContext + Send + Sync,
{
    fn build(&self, session_id: SessionId) -> SessionContext {
        self(session_id)
    }
}

pub struct SessionRegistry {
    contexts: RwLock<HashMap<SessionId, Arc<SessionContext>>>,
    factory: Arc<dyn ContextFactory>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Build and install a fresh context for `id`, discarding any stale one.
    pub(crate) fn install(&self, id: SessionId) -> Arc<SessionContext> {
        let context = Arc::new(self.factory.build(id));
        let stale = resilient_write(&self.contexts).insert(id, Arc::clone(&context));
        if stale.is_some() {
            tracing::debug!(session = id, "Discarded stale context");
        }
        context
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<SessionContext>> {
        resilient_write(&self.contexts).remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionContext>> {
        resilient_read(&self.contexts).get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        resilient_read(&self.contexts).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.contexts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
