//! Collaborator seams: embedding, knowledge retrieval, and generation.
//!
//! The pipeline only ever talks to these traits. `HfEmbedder` and
//! `HfGenerator` adapt the `hf-serve` client; tests use the mocks in
//! [`crate::testing`].

use crate::knowledge::{DeltaVector, DocFilters, KnowledgeDocument};
use async_trait::async_trait;
use futures::future::try_join_all;
use hf_serve::{FallbackRequest, HfServe, MainRequest};
use std::collections::HashMap;
use thiserror::Error;

/// Errors from collaborator calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("serving API error: {0}")]
    Serve(#[from] hf_serve::Error),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Generation failed: {0}")]
    Generation(String),
}

/// Which generation path a prompt targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Story-progressing generation with prediction heads; also used for
    /// the yes/no escalation and the validation/rewrite pass.
    Main,
    /// In-character, non-progressing generation.
    Fallback,
}

/// Output of a generation call.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    /// Head-predicted deltas, when the serving model has heads.
    pub deltas: Option<DeltaVector>,
    /// Per-flag predicted probabilities.
    pub flags_prob: HashMap<String, f32>,
    /// Per-flag predicted decision thresholds.
    pub flags_thr: HashMap<String, f32>,
}

impl Generation {
    /// A text-only generation with no head predictions.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Sentence embedding collaborator. Similarity is cosine.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text.
    async fn encode(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed a batch, one vector per input in order.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        try_join_all(texts.iter().map(|t| self.encode(t))).await
    }
}

/// Knowledge retrieval collaborator.
///
/// `query = None` is a filterless listing of everything matching the
/// metadata filters.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn retrieve(
        &self,
        query: Option<&str>,
        filters: &DocFilters,
        top_k: usize,
    ) -> Result<Vec<KnowledgeDocument>, ProviderError>;
}

/// Text generation collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, mode: GenerationMode, prompt: &str) -> Result<Generation, ProviderError>;
}

/// Cosine similarity between two vectors; 0.0 for mismatched or
/// zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ============================================================================
// hf-serve adapters
// ============================================================================

/// Embedder backed by the serving API's `/encode` endpoint.
#[derive(Clone)]
pub struct HfEmbedder {
    client: HfServe,
}

impl HfEmbedder {
    pub fn new(client: HfServe) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Embedder for HfEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.client.encode(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Embedding("empty encode response".to_string()))
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let vectors = self.client.encode(texts).await?;
        if vectors.len() != texts.len() {
            return Err(ProviderError::Embedding(format!(
                "encode returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

/// Generator backed by the serving API's predict endpoints.
#[derive(Clone)]
pub struct HfGenerator {
    client: HfServe,
}

impl HfGenerator {
    pub fn new(client: HfServe) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TextGenerator for HfGenerator {
    async fn generate(&self, mode: GenerationMode, prompt: &str) -> Result<Generation, ProviderError> {
        match mode {
            GenerationMode::Main => {
                let response = self.client.predict_main(MainRequest::new(prompt)).await?;
                Ok(Generation {
                    text: response.npc_output_text,
                    deltas: response
                        .deltas
                        .map(|d| DeltaVector::new(d.trust, d.relationship)),
                    flags_prob: response.flags_prob,
                    flags_thr: response.flags_thr,
                })
            }
            GenerationMode::Fallback => {
                let response = self
                    .client
                    .predict_fallback(FallbackRequest::new(prompt))
                    .await?;
                Ok(Generation::text(response.text))
            }
        }
    }
}
