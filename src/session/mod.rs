// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sessions and their private RAG contexts.
//!
//! - [`SessionStore`] owns the persisted `sessions` table and its expiry
//!   policy.
//! - [`SessionRegistry`] owns the in-memory [`SessionContext`] of each live
//!   session and is only mutated by the store.
//!
//! Per session id the lifecycle is `absent -> live -> absent`: a session
//! becomes live on `create` and leaves on `invalidate` or on an expiry sweep.

pub mod registry;
pub mod store;

pub use registry::{ContextFactory, SessionContext, SessionRegistry};
pub use store::{Clock, Session, SessionError, SessionStore, SystemClock};
