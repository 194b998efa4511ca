//! Turn orchestration.
//!
//! One request runs one linear pipeline: gate the input, generate on the
//! main or fallback path, reconcile, respond. The orchestrator owns the
//! per-NPC bundler registry and the collaborator handles; nothing here is
//! reachable through ambient globals.

use crate::config::PipelineConfig;
use crate::context::{ContextParser, GameStateSnapshot};
use crate::knowledge::{DeltaVector, KnowledgeBundler, TriggerMetaDoc};
use crate::prompt::PromptBuilder;
use crate::providers::{
    Embedder, GenerationMode, KnowledgeStore, ProviderError, TextGenerator,
};
use crate::reconcile::{extract_response, FlagDetail, ReconciledResult, ResponseReconciler};
use crate::trigger::{GateOutcome, TriggerGate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from turn handling.
#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// One dialogue turn from the game server.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub npc_id: String,
    pub user_input: String,
    pub context: GameStateSnapshot,
}

impl TurnRequest {
    pub fn new(
        session_id: impl Into<String>,
        npc_id: impl Into<String>,
        user_input: impl Into<String>,
        context: GameStateSnapshot,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            npc_id: npc_id.into(),
            user_input: user_input.into(),
            context,
        }
    }
}

/// The reconciled turn result returned to the game server.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub session_id: String,
    pub npc_output_text: String,
    pub deltas: DeltaVector,
    pub flags: BTreeMap<String, u8>,
    pub valid: bool,
    pub meta: TurnMeta,
}

/// Diagnostic metadata for a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnMeta {
    pub turn_id: Uuid,
    pub npc_id: String,
    pub quest_stage: String,
    pub location: String,
    pub additional_trigger: bool,
    pub trigger_meta: Option<TriggerMetaDoc>,
    pub confidence: Option<f32>,
    pub flags_detail: BTreeMap<String, FlagDetail>,
    pub flags_values: BTreeMap<String, String>,
    pub value_contexts: BTreeMap<String, Vec<String>>,
}

/// Sequences gate, generation, and reconciliation for each request.
pub struct DialogueOrchestrator {
    store: Arc<dyn KnowledgeStore>,
    generator: Arc<dyn TextGenerator>,
    config: PipelineConfig,
    gate: TriggerGate,
    prompts: PromptBuilder,
    reconciler: ResponseReconciler,
    bundlers: RwLock<HashMap<String, Arc<KnowledgeBundler>>>,
}

impl DialogueOrchestrator {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        config: PipelineConfig,
    ) -> Self {
        let gate = TriggerGate::new(embedder.clone(), generator.clone(), config.gate);
        let prompts = PromptBuilder::new(config.history_window);
        let reconciler = ResponseReconciler::new(
            embedder,
            generator.clone(),
            config.reconciler,
            config.jitter_seed,
        );
        Self {
            store,
            generator,
            config,
            gate,
            prompts,
            reconciler,
            bundlers: RwLock::new(HashMap::new()),
        }
    }

    /// Handle one dialogue turn end to end.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, DialogueError> {
        validate(&request)?;

        let session_id = request.session_id.clone();
        let input = request.user_input.clone();
        let ctx = ContextParser::new(request.npc_id.clone(), request.context);

        let bundler = self.bundler_for(ctx.npc_id()).await;
        let bundle = bundler.load_bundle(ctx.quest_stage(), ctx.location()).await;

        let gate = self.gate.evaluate(&input, &ctx, &bundle).await;
        debug!(
            npc_id = %ctx.npc_id(),
            is_valid = gate.is_valid,
            additional_trigger = gate.additional_trigger,
            "gate decided"
        );

        let result = if gate.is_valid {
            let prompt = self.prompts.main(&session_id, &input, &ctx, &bundle);
            let payload = self
                .generator
                .generate(GenerationMode::Main, &prompt)
                .await
                .map_err(DialogueError::Provider)?;
            self.reconciler
                .reconcile(&payload.text, &input, &ctx, &bundle, &payload, &self.prompts)
                .await?
        } else {
            let prompt = self.prompts.fallback(&session_id, &input, &ctx, &bundle, &gate);
            let payload = self
                .generator
                .generate(GenerationMode::Fallback, &prompt)
                .await
                .map_err(DialogueError::Provider)?;
            match (gate.additional_trigger, gate.trigger_meta.as_ref()) {
                (true, Some(meta)) => self.reconciler.reconcile_restricted(&payload.text, meta).await,
                _ => plain_fallback(&payload.text),
            }
        };

        let response = self.assemble(session_id, &ctx, gate, result);
        info!(
            npc_id = %response.meta.npc_id,
            turn_id = %response.meta.turn_id,
            valid = response.valid,
            flags = response.flags.len(),
            "turn complete"
        );
        Ok(response)
    }

    fn assemble(
        &self,
        session_id: String,
        ctx: &ContextParser,
        gate: GateOutcome,
        result: ReconciledResult,
    ) -> TurnResponse {
        TurnResponse {
            session_id,
            npc_output_text: result.text,
            deltas: result.deltas,
            flags: result.flags,
            valid: result.valid,
            meta: TurnMeta {
                turn_id: Uuid::new_v4(),
                npc_id: ctx.npc_id().to_string(),
                quest_stage: ctx.quest_stage().to_string(),
                location: ctx.location().to_string(),
                additional_trigger: gate.additional_trigger,
                trigger_meta: gate.trigger_meta,
                confidence: gate.confidence,
                flags_detail: result.detail,
                flags_values: result.values,
                value_contexts: result.value_contexts,
            },
        }
    }

    async fn bundler_for(&self, npc_id: &str) -> Arc<KnowledgeBundler> {
        if let Some(bundler) = self.bundlers.read().await.get(npc_id) {
            return bundler.clone();
        }
        let mut bundlers = self.bundlers.write().await;
        bundlers
            .entry(npc_id.to_string())
            .or_insert_with(|| {
                Arc::new(KnowledgeBundler::new(
                    npc_id,
                    self.store.clone(),
                    self.config.bundle_top_k,
                    self.config.cache_capacity,
                ))
            })
            .clone()
    }
}

/// A non-progressing fallback turn with no recognized trigger: no deltas,
/// no flags.
fn plain_fallback(raw_text: &str) -> ReconciledResult {
    let (text, _) = extract_response(raw_text);
    let valid = !text.is_empty();
    ReconciledResult {
        text,
        deltas: DeltaVector::default(),
        flags: BTreeMap::new(),
        valid,
        detail: BTreeMap::new(),
        values: BTreeMap::new(),
        value_contexts: BTreeMap::new(),
    }
}

fn validate(request: &TurnRequest) -> Result<(), DialogueError> {
    if request.session_id.trim().is_empty() {
        return Err(DialogueError::InvalidRequest("session_id is required".to_string()));
    }
    if request.npc_id.trim().is_empty() {
        return Err(DialogueError::InvalidRequest("npc_id is required".to_string()));
    }
    if request.user_input.trim().is_empty() {
        return Err(DialogueError::InvalidRequest("user_input is required".to_string()));
    }
    Ok(())
}
