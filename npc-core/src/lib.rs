//! NPC dialogue engine.
//!
//! This crate provides the decision-and-reconciliation pipeline behind
//! turn-based NPC dialogue:
//! - Two-stage trigger gating (deterministic rules, then semantic
//!   forbidden-trigger detection)
//! - Layered knowledge bundling with a bounded per-NPC cache
//! - Deterministic prompt assembly for the generation model
//! - Multi-signal reconciliation of model output into validated text,
//!   deltas, and story flags
//!
//! # Quick Start
//!
//! ```ignore
//! use npc_core::{DialogueOrchestrator, PipelineConfig, TurnRequest};
//! use npc_core::providers::{HfEmbedder, HfGenerator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = hf_serve::HfServe::from_env()?;
//!     let orchestrator = DialogueOrchestrator::new(
//!         store,
//!         Arc::new(HfEmbedder::new(client.clone())),
//!         Arc::new(HfGenerator::new(client)),
//!         PipelineConfig::default(),
//!     );
//!
//!     let response = orchestrator.handle_turn(request).await?;
//!     println!("{}", response.npc_output_text);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod knowledge;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod reconcile;
pub mod testing;
pub mod trigger;

// Primary public API
pub use config::{GateConfig, PipelineConfig, ReconcilerConfig};
pub use context::{ContextParser, GameStateSnapshot};
pub use knowledge::{DeltaVector, KnowledgeBundle, KnowledgeBundler, KnowledgeDocument};
pub use orchestrator::{DialogueError, DialogueOrchestrator, TurnRequest, TurnResponse};
pub use providers::{Embedder, Generation, KnowledgeStore, ProviderError, TextGenerator};
pub use reconcile::{ReconciledResult, ResponseReconciler};
pub use trigger::{GateOutcome, TriggerGate};
