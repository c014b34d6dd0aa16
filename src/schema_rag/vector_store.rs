//! Field embedding store
//!
//! One [`FieldIndex`] per schema snapshot version, holding an embedding for every table
//! and column. [`EmbeddingCache`] computes each version's index once and shares it
//! across sessions; a new version evicts the ones it supersedes from the same schema
//! origin, leaving other databases' indexes in place.

use crate::error::{CopilotError, Result};
use crate::metadata::{SchemaElement, SchemaSnapshot};
use crate::schema_rag::embedder::EmbeddingModel;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldEmbedding {
    pub element: SchemaElement,
    pub vector: Embedding,
}

/// Embeddings for every element of one snapshot version. Immutable once built.
#[derive(Debug)]
pub struct FieldIndex {
    pub version: String,
    pub origin: Option<Uuid>,
    pub entries: Vec<FieldEmbedding>,
}

/// A schema element with its similarity to a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredElement {
    pub element: SchemaElement,
    pub score: f32,
}

impl FieldIndex {
    /// Every element scored against `query`, best first.
    ///
    /// Equal scores are ordered by shorter qualified name, then lexically, so the
    /// ranking is deterministic.
    pub fn rank(&self, query: &[f32]) -> Vec<ScoredElement> {
        let mut scored: Vec<(String, ScoredElement)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.element.qualified_name(),
                    ScoredElement {
                        element: entry.element.clone(),
                        score: cosine_similarity(query, &entry.vector),
                    },
                )
            })
            .collect();

        scored.sort_by(|(name_a, a), (name_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| name_a.len().cmp(&name_b.len()))
                .then_with(|| name_a.cmp(name_b))
        });
        scored.into_iter().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared, per-version cache of field embeddings.
pub struct EmbeddingCache {
    indexes: DashMap<String, Arc<FieldIndex>>,
    build_lock: Mutex<()>,
    computations: AtomicUsize,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            indexes: DashMap::new(),
            build_lock: Mutex::new(()),
            computations: AtomicUsize::new(0),
        }
    }

    /// Cached index for a version, if one has been built.
    pub fn get(&self, version: &str) -> Option<Arc<FieldIndex>> {
        self.indexes.get(version).map(|entry| Arc::clone(entry.value()))
    }

    /// Index for `snapshot`, embedding its elements only if this version has not been
    /// seen. Concurrent callers for the same version wait for one computation.
    pub async fn get_or_build(
        &self,
        snapshot: &SchemaSnapshot,
        embedder: &dyn EmbeddingModel,
    ) -> Result<Arc<FieldIndex>> {
        if let Some(index) = self.get(&snapshot.version) {
            return Ok(index);
        }

        let _guard = self.build_lock.lock().await;
        if let Some(index) = self.get(&snapshot.version) {
            return Ok(index);
        }

        let elements = snapshot.elements();
        let texts: Vec<String> = elements.iter().map(|e| e.embedding_text()).collect();
        let vectors = embedder.embed_batch(&texts).await?;
        if vectors.len() != elements.len() {
            return Err(CopilotError::EmbeddingUnavailable(format!(
                "Embedded {} of {} schema elements",
                vectors.len(),
                elements.len()
            )));
        }

        let index = Arc::new(FieldIndex {
            version: snapshot.version.clone(),
            origin: snapshot.origin,
            entries: elements
                .into_iter()
                .zip(vectors)
                .map(|(element, vector)| FieldEmbedding { element, vector })
                .collect(),
        });

        // Only the newest snapshot per origin is kept.
        self.indexes.retain(|_, cached| cached.origin != snapshot.origin);
        self.indexes
            .insert(snapshot.version.clone(), Arc::clone(&index));
        self.computations.fetch_add(1, AtomicOrdering::SeqCst);
        info!(
            "Computed {} field embeddings with {} for schema {}",
            index.len(),
            embedder.name(),
            snapshot.version
        );
        Ok(index)
    }

    pub fn invalidate(&self, version: &str) {
        self.indexes.remove(version);
    }

    /// How many indexes have been computed since creation.
    pub fn computations(&self) -> usize {
        self.computations.load(AtomicOrdering::SeqCst)
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
