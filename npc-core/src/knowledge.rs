//! Knowledge documents, bundles, and the per-NPC bundle cache.
//!
//! Documents are a tagged sum type: every kind the pipeline consumes has
//! its own variant with typed fields, so consumers pattern-match instead
//! of probing string-keyed maps. Wildcard documents store the literal
//! field value `"any"` for quest stage and/or location; the store matches
//! filters by equality, so the bundler enumerates the four combinations.

use crate::providers::KnowledgeStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Field value marking a document as stage- or location-independent.
pub const WILDCARD: &str = "any";

/// Metadata filters for knowledge retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocFilters {
    pub npc_id: String,
    pub quest_stage: String,
    pub location: String,
}

/// A signed per-turn change to relationship-style state.
///
/// Both components are clamped to [-1.0, 1.0] on every write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaVector {
    #[serde(default)]
    pub trust: f32,
    #[serde(default)]
    pub relationship: f32,
}

impl DeltaVector {
    pub fn new(trust: f32, relationship: f32) -> Self {
        Self { trust, relationship }.clamped()
    }

    /// Return a copy with both components clamped to [-1.0, 1.0].
    pub fn clamped(self) -> Self {
        Self {
            trust: self.trust.clamp(-1.0, 1.0),
            relationship: self.relationship.clamp(-1.0, 1.0),
        }
    }
}

/// A retrieved knowledge document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub npc_id: String,
    #[serde(default)]
    pub quest_stage: String,
    #[serde(default)]
    pub location: String,
    /// Free-text content; empty for purely structural documents.
    #[serde(default)]
    pub text: String,
    #[serde(flatten)]
    pub body: DocBody,
}

impl KnowledgeDocument {
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_scope(mut self, quest_stage: impl Into<String>, location: impl Into<String>) -> Self {
        self.quest_stage = quest_stage.into();
        self.location = location.into();
        self
    }
}

/// Typed payload of a knowledge document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocBody {
    Lore,
    Description,
    NpcPersona,
    TriggerDef(TriggerDefDoc),
    FlagDef(FlagDefDoc),
    DialogueTurn(DialogueTurnDoc),
    TriggerMeta(TriggerMetaDoc),
    ForbiddenTriggerList(ForbiddenTriggerDoc),
    MainResValidate(ValidatePolicyDoc),
    Fallback,
}

impl DocBody {
    /// The kind tag for grouping.
    pub fn kind(&self) -> DocKind {
        match self {
            DocBody::Lore => DocKind::Lore,
            DocBody::Description => DocKind::Description,
            DocBody::NpcPersona => DocKind::NpcPersona,
            DocBody::TriggerDef(_) => DocKind::TriggerDef,
            DocBody::FlagDef(_) => DocKind::FlagDef,
            DocBody::DialogueTurn(_) => DocKind::DialogueTurn,
            DocBody::TriggerMeta(_) => DocKind::TriggerMeta,
            DocBody::ForbiddenTriggerList(_) => DocKind::ForbiddenTriggerList,
            DocBody::MainResValidate(_) => DocKind::MainResValidate,
            DocBody::Fallback => DocKind::Fallback,
        }
    }
}

/// Document kind, used as the grouping key inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Lore,
    Description,
    NpcPersona,
    TriggerDef,
    FlagDef,
    DialogueTurn,
    TriggerMeta,
    ForbiddenTriggerList,
    MainResValidate,
    Fallback,
}

/// A conjunctive trigger rule: satisfied iff every present mandatory
/// clause passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    /// Substring-any keywords; empty means the text clause always passes.
    #[serde(default)]
    pub required_text: Vec<String>,
    pub required_items: Option<RequirementSet>,
    pub required_actions: Option<RequirementSet>,
    pub required_game_state: Option<RequirementSet>,
    pub required_delta: Option<DeltaRequirement>,
}

/// A value list with a mandatory subset checked against the request's
/// pre-filtered `require` sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementSet {
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub mandatory: Vec<String>,
}

/// Per-key delta thresholds with a mandatory key subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaRequirement {
    #[serde(default)]
    pub thresholds: HashMap<String, f32>,
    #[serde(default)]
    pub mandatory: Vec<String>,
}

/// Trigger definition document: the gate rule for a stage/location plus
/// the reference deltas reconciliation corrects toward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefDoc {
    #[serde(default)]
    pub trigger: TriggerRule,
    /// Expected per-key delta values when this trigger's narrative plays out.
    #[serde(default)]
    pub delta_expected: HashMap<String, f32>,
    pub fallback_style: Option<FallbackStyle>,
}

/// Style overrides for fallback generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStyle {
    pub style: Option<String>,
    pub npc_action: Option<String>,
    pub npc_emotion: Option<String>,
}

/// Flag definition document: decision threshold, reference score, and
/// curated example sentences for embedding comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefDoc {
    pub name: String,
    #[serde(default = "default_flag_threshold")]
    pub threshold: f32,
    /// Retrieved reference score for this flag in this narrative context.
    #[serde(default)]
    pub rag_score: f32,
    #[serde(default)]
    pub examples_positive: Vec<String>,
    #[serde(default)]
    pub examples_negative: Vec<String>,
}

fn default_flag_threshold() -> f32 {
    0.8
}

/// Authored dialogue turn with the values story flags resolve to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurnDoc {
    #[serde(default)]
    pub turn_index: u32,
    #[serde(default)]
    pub flag_values: HashMap<String, String>,
}

/// Metadata for a recognized forbidden trigger: how the NPC reacts and
/// the fixed delta the turn carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetaDoc {
    pub trigger: String,
    pub npc_action: Option<String>,
    pub npc_emotion: Option<String>,
    pub npc_style: Option<String>,
    #[serde(default)]
    pub delta: DeltaVector,
}

/// Candidate lists for semantic forbidden-trigger detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForbiddenTriggerDoc {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub texts: Vec<String>,
}

/// Policy text for the response validation/rewrite pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatePolicyDoc {
    pub policy: String,
}

// ============================================================================
// Bundle
// ============================================================================

/// Retrieved documents for one `(npc, quest_stage, location)`, grouped by
/// kind. Within a kind, documents keep retrieval order: exact matches
/// arrive before wildcard ones.
#[derive(Debug, Default)]
pub struct KnowledgeBundle {
    docs: HashMap<DocKind, Vec<KnowledgeDocument>>,
}

impl KnowledgeBundle {
    /// Group a flat document list by kind.
    pub fn group(all: Vec<KnowledgeDocument>) -> Self {
        let mut docs: HashMap<DocKind, Vec<KnowledgeDocument>> = HashMap::new();
        for doc in all {
            docs.entry(doc.body.kind()).or_default().push(doc);
        }
        Self { docs }
    }

    /// All documents of a kind, in retrieval order.
    pub fn of_kind(&self, kind: DocKind) -> &[KnowledgeDocument] {
        self.docs.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of documents.
    pub fn len(&self) -> usize {
        self.docs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The trigger definition for this stage/location, most specific first.
    pub fn trigger_def(&self) -> Option<&TriggerDefDoc> {
        self.of_kind(DocKind::TriggerDef).iter().find_map(|d| match &d.body {
            DocBody::TriggerDef(def) => Some(def),
            _ => None,
        })
    }

    /// The forbidden-trigger candidate lists, if any.
    pub fn forbidden(&self) -> Option<&ForbiddenTriggerDoc> {
        self.of_kind(DocKind::ForbiddenTriggerList)
            .iter()
            .find_map(|d| match &d.body {
                DocBody::ForbiddenTriggerList(list) => Some(list),
                _ => None,
            })
    }

    /// All flag definitions.
    pub fn flag_defs(&self) -> Vec<&FlagDefDoc> {
        self.of_kind(DocKind::FlagDef)
            .iter()
            .filter_map(|d| match &d.body {
                DocBody::FlagDef(def) => Some(def),
                _ => None,
            })
            .collect()
    }

    /// Trigger metadata whose trigger string equals `trigger` exactly.
    pub fn trigger_meta(&self, trigger: &str) -> Option<&TriggerMetaDoc> {
        self.of_kind(DocKind::TriggerMeta)
            .iter()
            .find_map(|d| match &d.body {
                DocBody::TriggerMeta(meta) if meta.trigger == trigger => Some(meta),
                _ => None,
            })
    }

    /// The recorded value for `flag` from the newest dialogue turn
    /// (highest `turn_index`) that carries one.
    pub fn latest_flag_value(&self, flag: &str) -> Option<&str> {
        self.of_kind(DocKind::DialogueTurn)
            .iter()
            .filter_map(|d| match &d.body {
                DocBody::DialogueTurn(turn) => {
                    turn.flag_values.get(flag).map(|v| (turn.turn_index, v.as_str()))
                }
                _ => None,
            })
            .max_by_key(|(index, _)| *index)
            .map(|(_, value)| value)
    }

    /// Text snippets of all lore documents.
    pub fn lore_snippets(&self) -> Vec<&str> {
        self.text_snippets(DocKind::Lore)
    }

    /// Text snippets of all description documents.
    pub fn description_snippets(&self) -> Vec<&str> {
        self.text_snippets(DocKind::Description)
    }

    /// Text snippets of fallback documents.
    pub fn fallback_snippets(&self) -> Vec<&str> {
        self.text_snippets(DocKind::Fallback)
    }

    /// The validation policy text, if a policy document was retrieved.
    pub fn validate_policy(&self) -> Option<&str> {
        self.of_kind(DocKind::MainResValidate)
            .iter()
            .find_map(|d| match &d.body {
                DocBody::MainResValidate(doc) => Some(doc.policy.as_str()),
                _ => None,
            })
    }

    /// Lines from any document's text that literally contain `value`.
    pub fn value_contexts(&self, value: &str) -> Vec<String> {
        if value.is_empty() {
            return Vec::new();
        }
        let mut contexts = Vec::new();
        for docs in self.docs.values() {
            for doc in docs {
                for line in doc.text.lines() {
                    let line = line.trim();
                    if line.contains(value) && !contexts.iter().any(|c| c == line) {
                        contexts.push(line.to_string());
                    }
                }
            }
        }
        contexts
    }

    fn text_snippets(&self, kind: DocKind) -> Vec<&str> {
        self.of_kind(kind)
            .iter()
            .map(|d| d.text.as_str())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

// ============================================================================
// Bundler
// ============================================================================

/// Per-NPC knowledge loader with a bounded LRU cache.
///
/// A cache entry is the merged result of four retrieval calls: exact
/// stage/location, stage wildcard, location wildcard, and both wildcards.
/// Concurrent first population of the same key is benign: the content is
/// deterministic for given inputs, so last-write-wins is fine.
pub struct KnowledgeBundler {
    npc_id: String,
    store: Arc<dyn KnowledgeStore>,
    top_k: usize,
    capacity: usize,
    cache: RwLock<BundleCache>,
}

#[derive(Default)]
struct BundleCache {
    map: HashMap<String, Arc<KnowledgeBundle>>,
    order: VecDeque<String>,
}

impl BundleCache {
    fn get(&mut self, key: &str) -> Option<Arc<KnowledgeBundle>> {
        let bundle = self.map.get(key)?.clone();
        self.touch(key);
        Some(bundle)
    }

    fn insert(&mut self, key: String, bundle: Arc<KnowledgeBundle>, capacity: usize) {
        if self.map.insert(key.clone(), bundle).is_none() {
            self.order.push_back(key);
        } else {
            self.touch(&key);
        }
        while self.map.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key.to_string());
        }
    }
}

impl KnowledgeBundler {
    pub fn new(npc_id: impl Into<String>, store: Arc<dyn KnowledgeStore>, top_k: usize, capacity: usize) -> Self {
        Self {
            npc_id: npc_id.into(),
            store,
            top_k,
            capacity: capacity.max(1),
            cache: RwLock::new(BundleCache::default()),
        }
    }

    /// The NPC this bundler serves.
    pub fn npc_id(&self) -> &str {
        &self.npc_id
    }

    /// Load (or fetch from cache) the bundle for a stage/location.
    ///
    /// A failing retrieval variant contributes nothing; an empty bundle is
    /// a legal result and routes the turn down the fallback path.
    pub async fn load_bundle(&self, quest_stage: &str, location: &str) -> Arc<KnowledgeBundle> {
        let key = format!("{quest_stage}:{location}");

        if let Some(bundle) = self.cache.write().await.get(&key) {
            debug!(npc_id = %self.npc_id, %key, "bundle cache hit");
            return bundle;
        }

        let query = format!("{}:bundle", self.npc_id);
        let variants = [
            (quest_stage, location),
            (WILDCARD, location),
            (quest_stage, WILDCARD),
            (WILDCARD, WILDCARD),
        ];

        let mut all = Vec::new();
        for (stage, loc) in variants {
            let filters = DocFilters {
                npc_id: self.npc_id.clone(),
                quest_stage: stage.to_string(),
                location: loc.to_string(),
            };
            match self.store.retrieve(Some(&query), &filters, self.top_k).await {
                Ok(docs) => all.extend(docs),
                Err(e) => {
                    warn!(npc_id = %self.npc_id, stage, loc, error = %e, "knowledge retrieval failed, continuing with partial bundle");
                }
            }
        }

        let bundle = Arc::new(KnowledgeBundle::group(all));
        debug!(npc_id = %self.npc_id, %key, docs = bundle.len(), "bundle loaded");
        self.cache
            .write()
            .await
            .insert(key, bundle.clone(), self.capacity);
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{doc, MemoryStore};

    #[test]
    fn test_delta_vector_clamps() {
        let delta = DeltaVector::new(3.5, -2.0);
        assert_eq!(delta.trust, 1.0);
        assert_eq!(delta.relationship, -1.0);
    }

    #[test]
    fn test_document_deserialization() {
        let json = r#"{
            "id": "doc-1",
            "npc_id": "npc_001",
            "quest_stage": "stage_2",
            "location": "village",
            "text": "",
            "type": "flag_def",
            "name": "give_item",
            "rag_score": 0.7,
            "examples_positive": ["The NPC hands over the key."]
        }"#;
        let doc: KnowledgeDocument = serde_json::from_str(json).unwrap();

        match &doc.body {
            DocBody::FlagDef(def) => {
                assert_eq!(def.name, "give_item");
                assert_eq!(def.threshold, 0.8);
                assert_eq!(def.rag_score, 0.7);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_bundle_grouping_and_accessors() {
        let bundle = KnowledgeBundle::group(vec![
            doc("l1", "npc", DocBody::Lore).with_text("Old lore."),
            doc(
                "t1",
                "npc",
                DocBody::TriggerMeta(TriggerMetaDoc {
                    trigger: "insult the king".to_string(),
                    npc_action: Some("turns away".to_string()),
                    ..Default::default()
                }),
            ),
            doc(
                "d1",
                "npc",
                DocBody::DialogueTurn(DialogueTurnDoc {
                    turn_index: 3,
                    flag_values: [("give_item".to_string(), "rusty_key".to_string())].into(),
                }),
            ),
            doc(
                "d2",
                "npc",
                DocBody::DialogueTurn(DialogueTurnDoc {
                    turn_index: 7,
                    flag_values: [("give_item".to_string(), "silver_key".to_string())].into(),
                }),
            ),
        ]);

        assert_eq!(bundle.len(), 4);
        assert_eq!(bundle.lore_snippets(), vec!["Old lore."]);
        assert!(bundle.trigger_meta("insult the king").is_some());
        assert!(bundle.trigger_meta("other").is_none());
        // highest turn_index wins
        assert_eq!(bundle.latest_flag_value("give_item"), Some("silver_key"));
        assert_eq!(bundle.latest_flag_value("npc_action"), None);
    }

    #[test]
    fn test_value_contexts() {
        let bundle = KnowledgeBundle::group(vec![
            doc("l1", "npc", DocBody::Lore).with_text("The rusty_key opens the cellar.\nNothing else."),
            doc("l2", "npc", DocBody::Description).with_text("A rusty_key hangs on the wall."),
        ]);

        let contexts = bundle.value_contexts("rusty_key");
        assert_eq!(contexts.len(), 2);
        assert!(contexts[0].contains("rusty_key"));
        assert!(bundle.value_contexts("").is_empty());
    }

    #[tokio::test]
    async fn test_bundler_cache_idempotent() {
        let store = Arc::new(MemoryStore::new(vec![
            doc("l1", "npc_001", DocBody::Lore)
                .with_scope("stage_1", "village")
                .with_text("lore"),
            doc("l2", "npc_001", DocBody::Lore)
                .with_scope(WILDCARD, WILDCARD)
                .with_text("global lore"),
        ]));
        let bundler = KnowledgeBundler::new("npc_001", store.clone(), 50, 4);

        let first = bundler.load_bundle("stage_1", "village").await;
        let second = bundler.load_bundle("stage_1", "village").await;

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), first.len());
        // cache hit returns the same allocation, and the store saw exactly
        // one population (four variant queries)
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.query_count(), 4);
    }

    #[tokio::test]
    async fn test_bundler_lru_eviction() {
        let store = Arc::new(MemoryStore::new(vec![doc("l", "npc_001", DocBody::Lore)
            .with_scope(WILDCARD, WILDCARD)
            .with_text("lore")]));
        let bundler = KnowledgeBundler::new("npc_001", store.clone(), 50, 2);

        bundler.load_bundle("a", "x").await;
        bundler.load_bundle("b", "x").await;
        bundler.load_bundle("a", "x").await; // touch a
        bundler.load_bundle("c", "x").await; // evicts b
        let before = store.query_count();
        bundler.load_bundle("a", "x").await; // still cached
        assert_eq!(store.query_count(), before);
        bundler.load_bundle("b", "x").await; // refetches
        assert_eq!(store.query_count(), before + 4);
    }

    #[tokio::test]
    async fn test_bundler_degrades_on_store_failure() {
        let store = Arc::new(MemoryStore::failing());
        let bundler = KnowledgeBundler::new("npc_001", store, 50, 4);

        let bundle = bundler.load_bundle("stage_1", "village").await;
        assert!(bundle.is_empty());
    }
}
