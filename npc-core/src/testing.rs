//! Testing utilities for the dialogue pipeline.
//!
//! Provides deterministic stand-ins for every collaborator seam plus a
//! harness that wires them into a full orchestrator:
//! - `MockEmbedder` with canned unit vectors per text
//! - `MockGenerator` with a scripted response queue
//! - `MemoryStore` with equality-filtered in-memory documents
//! - `TurnHarness` for end-to-end turns without network calls

use crate::config::PipelineConfig;
use crate::knowledge::{DocBody, DocFilters, KnowledgeDocument};
use crate::orchestrator::{DialogueError, DialogueOrchestrator, TurnRequest, TurnResponse};
use crate::context::GameStateSnapshot;
use crate::providers::{
    Embedder, Generation, GenerationMode, KnowledgeStore, ProviderError, TextGenerator,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Build a document fixture scoped to wildcard stage/location.
pub fn doc(id: &str, npc_id: &str, body: DocBody) -> KnowledgeDocument {
    KnowledgeDocument {
        id: id.to_string(),
        npc_id: npc_id.to_string(),
        quest_stage: crate::knowledge::WILDCARD.to_string(),
        location: crate::knowledge::WILDCARD.to_string(),
        text: String::new(),
        body,
    }
}

// ============================================================================
// MockEmbedder
// ============================================================================

/// Embedder returning canned vectors keyed by exact text.
///
/// Unknown texts error unless a default vector is set, so tests notice
/// unexpected encode calls. Clones share state.
#[derive(Clone, Default)]
pub struct MockEmbedder {
    inner: Arc<EmbedderInner>,
}

#[derive(Default)]
struct EmbedderInner {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    default: Mutex<Option<Vec<f32>>>,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form: register a vector for a text.
    pub fn with_vector(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.add_vector(text, vector);
        self
    }

    /// Builder form: vector returned for unregistered texts.
    pub fn with_default(self, vector: Vec<f32>) -> Self {
        *self.inner.default.lock().expect("mock poisoned") = Some(vector);
        self
    }

    /// Set the default vector after construction.
    pub fn add_default(&self, vector: Vec<f32>) {
        *self.inner.default.lock().expect("mock poisoned") = Some(vector);
    }

    /// Register a vector after construction.
    pub fn add_vector(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.inner
            .vectors
            .lock()
            .expect("mock poisoned")
            .insert(text.into(), vector);
    }

    /// How many single-text encodes have run.
    pub fn encode_calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(vector) = self.inner.vectors.lock().expect("mock poisoned").get(text) {
            return Ok(vector.clone());
        }
        if let Some(default) = self.inner.default.lock().expect("mock poisoned").clone() {
            return Ok(default);
        }
        Err(ProviderError::Embedding(format!(
            "no canned vector for {text:?}"
        )))
    }
}

// ============================================================================
// MockGenerator
// ============================================================================

/// Generator returning scripted responses in order.
///
/// Records every prompt it sees; clones share the queue and the record.
#[derive(Clone)]
pub struct MockGenerator {
    inner: Arc<GeneratorInner>,
}

struct GeneratorInner {
    responses: Mutex<VecDeque<Generation>>,
    prompts: Mutex<Vec<(GenerationMode, String)>>,
    fail: bool,
}

impl MockGenerator {
    pub fn new(responses: Vec<Generation>) -> Self {
        Self {
            inner: Arc::new(GeneratorInner {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
                fail: false,
            }),
        }
    }

    /// A generator whose every call fails.
    pub fn failing() -> Self {
        Self {
            inner: Arc::new(GeneratorInner {
                responses: Mutex::new(VecDeque::new()),
                prompts: Mutex::new(Vec::new()),
                fail: true,
            }),
        }
    }

    /// Append a response to the queue.
    pub fn queue(&self, generation: Generation) {
        self.inner
            .responses
            .lock()
            .expect("mock poisoned")
            .push_back(generation);
    }

    /// Every prompt this generator has seen, in order.
    pub fn prompts(&self) -> Vec<(GenerationMode, String)> {
        self.inner.prompts.lock().expect("mock poisoned").clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, mode: GenerationMode, prompt: &str) -> Result<Generation, ProviderError> {
        self.inner
            .prompts
            .lock()
            .expect("mock poisoned")
            .push((mode, prompt.to_string()));
        if self.inner.fail {
            return Err(ProviderError::Generation("scripted failure".to_string()));
        }
        let next = self
            .inner
            .responses
            .lock()
            .expect("mock poisoned")
            .pop_front();
        Ok(next.unwrap_or_else(|| Generation::text("...")))
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory knowledge store with equality metadata matching.
pub struct MemoryStore {
    docs: Vec<KnowledgeDocument>,
    queries: AtomicUsize,
    fail: bool,
}

impl MemoryStore {
    pub fn new(docs: Vec<KnowledgeDocument>) -> Self {
        Self {
            docs,
            queries: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// A store whose every retrieval fails.
    pub fn failing() -> Self {
        Self {
            docs: Vec::new(),
            queries: AtomicUsize::new(0),
            fail: true,
        }
    }

    /// How many retrieval calls have run.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeStore for MemoryStore {
    async fn retrieve(
        &self,
        _query: Option<&str>,
        filters: &DocFilters,
        top_k: usize,
    ) -> Result<Vec<KnowledgeDocument>, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Retrieval("scripted failure".to_string()));
        }
        Ok(self
            .docs
            .iter()
            .filter(|d| {
                d.npc_id == filters.npc_id
                    && d.quest_stage == filters.quest_stage
                    && d.location == filters.location
            })
            .take(top_k)
            .cloned()
            .collect())
    }
}

// ============================================================================
// TurnHarness
// ============================================================================

/// A full orchestrator over mocks, for scripted end-to-end turns.
pub struct TurnHarness {
    pub store: Arc<MemoryStore>,
    pub embedder: MockEmbedder,
    pub generator: MockGenerator,
    pub orchestrator: DialogueOrchestrator,
}

impl TurnHarness {
    /// Create a harness with a fixed jitter seed for reproducible runs.
    pub fn new(docs: Vec<KnowledgeDocument>) -> Self {
        Self::with_config(docs, PipelineConfig::default().with_jitter_seed(42))
    }

    pub fn with_config(docs: Vec<KnowledgeDocument>, config: PipelineConfig) -> Self {
        let store = Arc::new(MemoryStore::new(docs));
        let embedder = MockEmbedder::new();
        let generator = MockGenerator::new(Vec::new());
        let orchestrator = DialogueOrchestrator::new(
            store.clone(),
            Arc::new(embedder.clone()),
            Arc::new(generator.clone()),
            config,
        );
        Self {
            store,
            embedder,
            generator,
            orchestrator,
        }
    }

    /// Queue a generation for the next model call.
    pub fn expect_generation(&self, generation: Generation) -> &Self {
        self.generator.queue(generation);
        self
    }

    /// Run one turn.
    pub async fn turn(
        &self,
        input: &str,
        snapshot: GameStateSnapshot,
    ) -> Result<TurnResponse, DialogueError> {
        self.orchestrator
            .handle_turn(TurnRequest::new("test-session", "npc_001", input, snapshot))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_errors_on_unknown_text() {
        let embedder = MockEmbedder::new().with_vector("known", vec![1.0, 0.0]);

        assert_eq!(embedder.encode("known").await.unwrap(), vec![1.0, 0.0]);
        assert!(embedder.encode("unknown").await.is_err());
        assert_eq!(embedder.encode_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_embedder_default_vector() {
        let embedder = MockEmbedder::new().with_default(vec![0.0, 1.0]);
        assert_eq!(embedder.encode("anything").await.unwrap(), vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_mock_generator_scripted_order() {
        let generator = MockGenerator::new(vec![Generation::text("one")]);
        generator.queue(Generation::text("two"));

        let first = generator.generate(GenerationMode::Main, "p1").await.unwrap();
        let second = generator.generate(GenerationMode::Fallback, "p2").await.unwrap();
        let third = generator.generate(GenerationMode::Main, "p3").await.unwrap();

        assert_eq!(first.text, "one");
        assert_eq!(second.text, "two");
        assert_eq!(third.text, "...");
        assert_eq!(generator.prompts().len(), 3);
        assert_eq!(generator.prompts()[1].0, GenerationMode::Fallback);
    }

    #[tokio::test]
    async fn test_memory_store_filters() {
        let store = MemoryStore::new(vec![
            doc("a", "npc_001", DocBody::Lore),
            {
                let mut d = doc("b", "npc_001", DocBody::Lore);
                d.quest_stage = "stage_1".to_string();
                d
            },
            doc("c", "npc_002", DocBody::Lore),
        ]);
        let filters = DocFilters {
            npc_id: "npc_001".to_string(),
            quest_stage: crate::knowledge::WILDCARD.to_string(),
            location: crate::knowledge::WILDCARD.to_string(),
        };

        let docs = store.retrieve(None, &filters, 10).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");
    }
}
