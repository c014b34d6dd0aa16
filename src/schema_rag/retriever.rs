//! Semantic Matcher
//!
//! Aligns free-text terms in a request with schema elements by embedding similarity.
//! Elements scoring below the similarity floor are left out instead of being forced
//! into a match, and the terms that matched nothing are reported so the prompt can
//! tell the generator not to invent fields for them.

use crate::error::{CopilotError, Result};
use crate::metadata::{SchemaElement, SchemaSnapshot, Table};
use crate::schema_rag::embedder::EmbeddingModel;
use crate::schema_rag::vector_store::{Embedding, EmbeddingCache, FieldIndex, ScoredElement};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "a", "all", "an", "and", "any", "are", "as", "at", "be", "best", "by", "can", "compute",
        "did", "do", "does", "each", "every", "find", "for", "from", "get", "give", "has", "have",
        "how", "in", "into", "is", "it", "its", "list", "many", "me", "much", "my", "of", "on",
        "or", "our", "over", "per", "please", "return", "show", "than", "that", "the", "their",
        "them", "these", "this", "those", "to", "top", "total", "was", "were", "what", "which",
        "who", "whose", "with", "within",
    ]
    .into_iter()
    .collect();
}

/// Ranked schema elements for one term, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub term: String,
    pub matches: Vec<MatchedElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedElement {
    pub element: SchemaElement,
    pub similarity: f32,
}

impl From<ScoredElement> for MatchedElement {
    fn from(scored: ScoredElement) -> Self {
        Self {
            element: scored.element,
            similarity: scored.score,
        }
    }
}

/// What the generator is told about the schema for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaContext {
    pub snapshot_version: String,
    /// Elements matched by any request term, best similarity kept, best first.
    pub matched: Vec<MatchedElement>,
    /// Request terms with no element above the similarity floor.
    pub unmatched_terms: Vec<String>,
    /// Every table of the snapshot, the fallback the generator can always use.
    pub tables: Vec<Table>,
    /// False when similarity ranking was unavailable.
    pub ranked: bool,
}

impl SchemaContext {
    /// Unranked context listing the whole schema.
    pub fn full_listing(snapshot: &SchemaSnapshot) -> Self {
        Self {
            snapshot_version: snapshot.version.clone(),
            matched: Vec::new(),
            unmatched_terms: Vec::new(),
            tables: snapshot.tables.clone(),
            ranked: false,
        }
    }

    /// Distinct tables of the matched elements, in match order.
    pub fn matched_tables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.matched
            .iter()
            .map(|m| m.element.table())
            .filter(|t| seen.insert(t.to_lowercase()))
            .collect()
    }
}

pub struct SemanticMatcher {
    embedder: Arc<dyn EmbeddingModel>,
    cache: Arc<EmbeddingCache>,
    similarity_floor: f32,
    top_k: usize,
}

impl SemanticMatcher {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        cache: Arc<EmbeddingCache>,
        similarity_floor: f32,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            cache,
            similarity_floor,
            top_k,
        }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embedder.embed(text).await.map_err(as_embedding_error)
    }

    async fn field_index(&self, snapshot: &SchemaSnapshot) -> Result<Arc<FieldIndex>> {
        self.cache
            .get_or_build(snapshot, self.embedder.as_ref())
            .await
            .map_err(as_embedding_error)
    }

    /// At most `k` elements of `snapshot` at or above the similarity floor, best first.
    pub async fn match_term(&self, term: &str, snapshot: &SchemaSnapshot, k: usize) -> Result<MatchResult> {
        let index = self.field_index(snapshot).await?;
        let query = self.embed(term).await?;
        Ok(self.match_with_index(term, &query, &index, k))
    }

    fn match_with_index(&self, term: &str, query: &[f32], index: &FieldIndex, k: usize) -> MatchResult {
        let matches = index
            .rank(query)
            .into_iter()
            .filter(|scored| scored.score >= self.similarity_floor)
            .take(k)
            .map(MatchedElement::from)
            .collect();
        MatchResult {
            term: term.to_string(),
            matches,
        }
    }

    /// Match every term of `request` and merge the results into one context.
    pub async fn build_context(&self, request: &str, snapshot: &SchemaSnapshot) -> Result<SchemaContext> {
        let index = self.field_index(snapshot).await?;
        let terms = extract_terms(request);

        let mut best: HashMap<String, MatchedElement> = HashMap::new();
        let mut unmatched_terms = Vec::new();
        for term in &terms {
            let query = self.embed(term).await?;
            let result = self.match_with_index(term, &query, &index, self.top_k);
            debug!("Term '{}' matched {} schema elements", term, result.matches.len());
            if result.matches.is_empty() {
                unmatched_terms.push(term.clone());
                continue;
            }
            for matched in result.matches {
                let key = matched.element.qualified_name();
                match best.get(&key) {
                    Some(existing) if existing.similarity >= matched.similarity => {}
                    _ => {
                        best.insert(key, matched);
                    }
                }
            }
        }

        let mut matched: Vec<(String, MatchedElement)> = best.into_iter().collect();
        matched.sort_by(|(name_a, a), (name_b, b)| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| name_a.len().cmp(&name_b.len()))
                .then_with(|| name_a.cmp(name_b))
        });

        Ok(SchemaContext {
            snapshot_version: snapshot.version.clone(),
            matched: matched.into_iter().map(|(_, m)| m).collect(),
            unmatched_terms,
            tables: snapshot.tables.clone(),
            ranked: true,
        })
    }
}

fn as_embedding_error(err: CopilotError) -> CopilotError {
    match err {
        CopilotError::EmbeddingUnavailable(_) => err,
        other => CopilotError::EmbeddingUnavailable(other.to_string()),
    }
}

/// Content words of a request: lowercase, no stop words or bare numbers, first
/// occurrence order.
pub fn extract_terms(request: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    request
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|w| w.trim_matches('_').to_lowercase())
        .filter(|w| w.len() >= 2)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOP_WORDS.contains(w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}
