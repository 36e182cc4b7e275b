// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Role-tagged prompt templates with typed placeholders.
//!
//! A [`Template`] is an ordered list of messages, each either literal text
//! or a reference to a [`Slot`], plus the ordered list of [`Binding`]s that
//! fill those slots. Substitution happens in [`Template::render`], which the
//! model clients call at dispatch time.

use std::fmt;
use thiserror::Error;

use crate::types::{Message, Role};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("placeholder `{0}` has no binding")]
    Unbound(Slot),
}

/// What a placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Passage `rank` retrieved for query `query`.
    ContextSnippet { query: usize, rank: usize },
    /// The text of query `index`.
    Query { index: usize },
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextSnippet { query, rank } => write!(f, "query_{}_{}", query, rank),
            Self::Query { index } => write!(f, "query_{}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Slot(Slot),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMessage {
    pub role: Role,
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub slot: Slot,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    messages: Vec<TemplateMessage>,
    bindings: Vec<Binding>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble from parts. Nothing is checked until [`Template::render`].
    pub fn from_parts(messages: Vec<TemplateMessage>, bindings: Vec<Binding>) -> Self {
        Self { messages, bindings }
    }

    /// Append a literal message.
    pub fn push_text(&mut self, role: Role, text: impl Into<String>) {
        self.messages.push(TemplateMessage {
            role,
            segment: Segment::Text(text.into()),
        });
    }

    /// Bind `text` to `slot` and append a message referencing it.
    pub fn push_slot(&mut self, role: Role, slot: Slot, text: impl Into<String>) {
        self.bindings.push(Binding {
            slot,
            text: text.into(),
        });
        self.messages.push(TemplateMessage {
            role,
            segment: Segment::Slot(slot),
        });
    }

    pub fn messages(&self) -> &[TemplateMessage] {
        &self.messages
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Number of passage placeholders bound for query `index`.
    pub fn snippet_count(&self, index: usize) -> usize {
        self.bindings
            .iter()
            .filter(|b| matches!(b.slot, Slot::ContextSnippet { query, .. } if query == index))
            .count()
    }

    fn resolve(&self, slot: Slot) -> Result<&str, RenderError> {
        self.bindings
            .iter()
            .find(|b| b.slot == slot)
            .map(|b| b.text.as_str())
            .ok_or(RenderError::Unbound(slot))
    }

    /// Substitute every placeholder, producing backend messages in order.
    pub fn render(&self) -> Result<Vec<Message>, RenderError> {
        self.messages
            .iter()
            .map(|message| {
                let content = match &message.segment {
                    Segment::Text(text) => text.as_str(),
                    Segment::Slot(slot) => self.resolve(*slot)?,
                };
                Ok(Message::from_role(message.role, content))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_names() {
        assert_eq!(Slot::ContextSnippet { query: 0, rank: 1 }.to_string(), "query_0_1");
        assert_eq!(Slot::Query { index: 2 }.to_string(), "query_2");
    }

    #[test]
    fn test_render_substitutes_in_order() {
        let mut template = Template::new();
        template.push_text(Role::System, "Given that: ");
        template.push_slot(Role::System, Slot::ContextSnippet { query: 0, rank: 0 }, "doc text");
        template.push_text(Role::System, "Answer the following: ");
        template.push_slot(Role::Human, Slot::Query { index: 0 }, "What is X?");

        let rendered = template.render().unwrap();
        let contents: Vec<&str> = rendered.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Given that: ", "doc text", "Answer the following: ", "What is X?"]);
        assert_eq!(rendered[3].role, "user");
        assert_eq!(template.snippet_count(0), 1);
    }

    #[test]
    fn test_render_rejects_unbound_slot() {
        let template = Template::from_parts(
            vec![TemplateMessage {
                role: Role::Human,
                segment: Segment::Slot(Slot::Query { index: 3 }),
            }],
            Vec::new(),
        );
        assert_eq!(template.render(), Err(RenderError::Unbound(Slot::Query { index: 3 })));
    }
}
