// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Document indexing and passage retrieval.
//!
//! [`Indexer`] is the contract the prompt pipeline consumes. Each session
//! gets its own index; [`MemoryIndex`] is the in-process implementation
//! used by the server.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::security::{resilient_read, resilient_write};
use crate::types::DocumentSubmission;

pub type PassageId = u64;

/// One entry of a ranked search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchHit {
    Passage(PassageId),
    /// No more results. Everything after this marker is ignored.
    Exhausted,
}

#[async_trait]
pub trait Indexer: Send + Sync {
    /// Index a document. Returns the number of passages added.
    async fn add(&self, source: DocumentSubmission, label: &str) -> Result<usize>;

    /// Up to `top` ranked hits, possibly cut short by [`SearchHit::Exhausted`].
    async fn search(&self, query: &str, top: usize) -> Result<Vec<SearchHit>>;

    /// `(label, text)` of a passage.
    async fn retrieve(&self, id: PassageId) -> Result<(String, String)>;
}

/// Longest passage produced when splitting a document.
const MAX_PASSAGE_CHARS: usize = 800;

/// Timeout for fetching `Url` documents.
const FETCH_TIMEOUT_SECS: u64 = 30;

struct Passage {
    label: String,
    text: String,
    terms: HashMap<String, f64>,
    norm: f64,
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn term_vector(text: &str) -> (HashMap<String, f64>, f64) {
    let mut terms: HashMap<String, f64> = HashMap::new();
    for token in tokenize(text) {
        *terms.entry(token).or_insert(0.0) += 1.0;
    }
    let norm = terms.values().map(|v| v * v).sum::<f64>().sqrt();
    (terms, norm)
}

/// Split on blank lines, then pack paragraphs into passages of at most
/// [`MAX_PASSAGE_CHARS`] characters. Oversized paragraphs are cut on word
/// boundaries.
pub fn split_passages(text: &str) -> Vec<String> {
    let mut passages = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, passages: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            passages.push(trimmed.to_string());
        }
        current.clear();
    };

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for word in paragraph.split_whitespace() {
            let needed = word.chars().count() + usize::from(!current.is_empty());
            if current.chars().count() + needed > MAX_PASSAGE_CHARS {
                flush(&mut current, &mut passages);
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        // Keep short neighbouring paragraphs together.
        if current.chars().count() > MAX_PASSAGE_CHARS / 2 {
            flush(&mut current, &mut passages);
        } else if !current.is_empty() {
            current.push('\n');
        }
    }
    flush(&mut current, &mut passages);
    passages
}

/// In-process term-frequency index.
pub struct MemoryIndex {
    passages: RwLock<Vec<Passage>>,
    http: reqwest::Client,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl MemoryIndex {
    /// `http` is used to fetch `Url` submissions.
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            passages: RwLock::new(Vec::new()),
            http,
        }
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.passages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .send()
            .await
            .with_context(|| format!("Failed to fetch document {}", url))?;

        if !response.status().is_success() {
            return Err(anyhow!("Fetching {} failed: HTTP {}", url, response.status()));
        }
        response
            .text()
            .await
            .with_context(|| format!("Failed to read document body from {}", url))
    }

    /// Index already-fetched text under `label`.
    pub fn add_text(&self, text: &str, label: &str) -> usize {
        let new: Vec<Passage> = split_passages(text)
            .into_iter()
            .map(|text| {
                let (terms, norm) = term_vector(&text);
                Passage {
                    label: label.to_string(),
                    text,
                    terms,
                    norm,
                }
            })
            .collect();
        let added = new.len();
        resilient_write(&self.passages).extend(new);
        added
    }

    fn rank(&self, query: &str, top: usize) -> Vec<SearchHit> {
        let (query_terms, query_norm) = term_vector(query);
        let passages = resilient_read(&self.passages);

        let mut scored: Vec<(PassageId, f64)> = Vec::new();
        if query_norm > 0.0 {
            for (id, passage) in passages.iter().enumerate() {
                if passage.norm == 0.0 {
                    continue;
                }
                let dot: f64 = query_terms
                    .iter()
                    .filter_map(|(term, weight)| passage.terms.get(term).map(|w| w * weight))
                    .sum();
                if dot > 0.0 {
                    scored.push((id as PassageId, dot / (query_norm * passage.norm)));
                }
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .take(top)
            .map(|(id, _)| SearchHit::Passage(id))
            .collect();
        if hits.len() < top {
            hits.push(SearchHit::Exhausted);
        }
        hits
    }
}

#[async_trait]
impl Indexer for MemoryIndex {
    async fn add(&self, source: DocumentSubmission, label: &str) -> Result<usize> {
        let text = match source {
            DocumentSubmission::Url(url) => self.fetch(&url).await?,
            DocumentSubmission::InlineContent(content) => content,
        };
        let added = self.add_text(&text, label);
        tracing::debug!(label, passages = added, "Indexed document");
        Ok(added)
    }

    async fn search(&self, query: &str, top: usize) -> Result<Vec<SearchHit>> {
        Ok(self.rank(query, top))
    }

    async fn retrieve(&self, id: PassageId) -> Result<(String, String)> {
        let passages = resilient_read(&self.passages);
        let passage = passages
            .get(id as usize)
            .ok_or_else(|| anyhow!("No passage with id {}", id))?;
        Ok((passage.label.clone(), passage.text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_passages_respects_limit() {
        let long = "word ".repeat(500);
        let passages = split_passages(&long);
        assert!(passages.len() > 1);
        assert!(passages.iter().all(|p| p.chars().count() <= MAX_PASSAGE_CHARS));
    }

    #[test]
    fn test_split_passages_skips_blank_input() {
        assert!(split_passages("  \n\n \n").is_empty());
    }

    #[tokio::test]
    async fn test_search_ranks_matching_passage_first() {
        let index = MemoryIndex::default();
        index.add_text(&format!("{}\n\n{}", "a".repeat(500), "Rust ownership rules"), "doc");
        index.add_text("The borrow checker enforces ownership in Rust.", "doc2");
        index.add_text("Bananas are yellow.", "doc3");

        let hits = index.search("rust ownership", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        for hit in &hits {
            match hit {
                SearchHit::Passage(id) => {
                    let (_, text) = index.retrieve(*id).await.unwrap();
                    assert!(text.to_lowercase().contains("ownership"));
                }
                SearchHit::Exhausted => panic!("expected two matches"),
            }
        }
    }

    #[tokio::test]
    async fn test_search_ends_short_results_with_exhausted_marker() {
        let index = MemoryIndex::default();
        index
            .add(DocumentSubmission::InlineContent("only one passage about cats".into()), "inline")
            .await
            .unwrap();

        let hits = index.search("cats", 3).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(matches!(hits[0], SearchHit::Passage(_)));
        assert_eq!(hits[1], SearchHit::Exhausted);
    }

    #[tokio::test]
    async fn test_search_with_huge_top_stays_bounded() {
        let index = MemoryIndex::default();
        index.add_text("cats are small", "doc");

        let hits = index.search("cats", usize::MAX).await.unwrap();
        assert_eq!(hits, vec![SearchHit::Passage(0), SearchHit::Exhausted]);

        let none = index.search("dogs", usize::MAX).await.unwrap();
        assert_eq!(none, vec![SearchHit::Exhausted]);
    }

    #[tokio::test]
    async fn test_retrieve_returns_label() {
        let index = MemoryIndex::default();
        index.add_text("hello world", "greeting");
        let (label, text) = index.retrieve(0).await.unwrap();
        assert_eq!(label, "greeting");
        assert_eq!(text, "hello world");
        assert!(index.retrieve(5).await.is_err());
    }
}
