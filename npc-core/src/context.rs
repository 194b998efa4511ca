//! Game-state snapshot types and the context parser.
//!
//! A snapshot arrives with every request and is immutable for the turn.
//! The parser derives the views the rest of the pipeline needs: retrieval
//! filters, prompt tags, the history window, and the `require` sets the
//! trigger gate checks against.

use crate::knowledge::{DocFilters, TriggerRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Pre-filtered mandatory elements supplied by the game server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Require {
    #[serde(default)]
    pub items: HashSet<String>,
    #[serde(default)]
    pub actions: HashSet<String>,
    #[serde(default)]
    pub game_state: HashSet<String>,
    #[serde(default)]
    pub delta: HashMap<String, f32>,
}

/// Player view of the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    pub location: Option<String>,
    pub reputation: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Global game view of the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameState {
    pub quest_stage: Option<String>,
    pub location: Option<String>,
    pub time_of_day: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Current NPC state as the game server last persisted it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NpcState {
    pub mood: Option<String>,
    pub relationship: Option<f32>,
    pub trust: Option<f32>,
    pub style: Option<String>,
    /// Per-emotion scores, summarized into the fallback prompt.
    #[serde(default)]
    pub emotions: HashMap<String, f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Designed NPC configuration (persona and per-stage trigger rules).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NpcProfile {
    pub id: Option<String>,
    pub name: Option<String>,
    pub persona_name: Option<String>,
    pub dialogue_style: Option<String>,
    pub relationship: Option<f32>,
    pub npc_mood: Option<String>,
    #[serde(default)]
    pub trigger_definitions: HashMap<String, TriggerRule>,
}

/// One player/NPC exchange from the recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub player: String,
    pub npc: String,
}

/// The full per-request snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameStateSnapshot {
    pub require: Option<Require>,
    #[serde(default)]
    pub player_state: PlayerState,
    #[serde(default)]
    pub game_state: GameState,
    #[serde(default)]
    pub npc_state: NpcState,
    pub npc_config: Option<NpcProfile>,
    #[serde(default)]
    pub dialogue_history: Vec<DialogueTurn>,
}

/// Tag values the prompt builder interpolates.
#[derive(Debug, Clone)]
pub struct PromptTags {
    pub npc_id: String,
    pub location: String,
    pub quest_stage: String,
    pub mood: String,
    pub relationship: String,
    pub trust: String,
    pub reputation: String,
    pub style: String,
}

/// Derives pipeline views from a snapshot.
pub struct ContextParser {
    npc_id: String,
    snapshot: GameStateSnapshot,
}

impl ContextParser {
    pub fn new(npc_id: impl Into<String>, snapshot: GameStateSnapshot) -> Self {
        Self {
            npc_id: npc_id.into(),
            snapshot,
        }
    }

    pub fn npc_id(&self) -> &str {
        &self.npc_id
    }

    pub fn snapshot(&self) -> &GameStateSnapshot {
        &self.snapshot
    }

    /// The quest stage, defaulting to `"default"` when the game omits it.
    pub fn quest_stage(&self) -> &str {
        self.snapshot
            .game_state
            .quest_stage
            .as_deref()
            .unwrap_or("default")
    }

    /// The location: game location, then player location, then `"unknown"`.
    pub fn location(&self) -> &str {
        self.snapshot
            .game_state
            .location
            .as_deref()
            .or(self.snapshot.player_state.location.as_deref())
            .unwrap_or("unknown")
    }

    /// Retrieval filters for this turn.
    pub fn filters(&self) -> DocFilters {
        DocFilters {
            npc_id: self.npc_id.clone(),
            quest_stage: self.quest_stage().to_string(),
            location: self.location().to_string(),
        }
    }

    /// The request's pre-filtered mandatory sets, empty when absent.
    pub fn require(&self) -> Require {
        self.snapshot.require.clone().unwrap_or_default()
    }

    /// The per-stage trigger rule from the NPC profile, if configured.
    pub fn profile_rule(&self) -> Option<&TriggerRule> {
        self.snapshot
            .npc_config
            .as_ref()?
            .trigger_definitions
            .get(self.quest_stage())
    }

    /// Tag values for prompt assembly.
    pub fn prompt_tags(&self) -> PromptTags {
        let npc = &self.snapshot.npc_state;
        let profile = self.snapshot.npc_config.as_ref();
        PromptTags {
            npc_id: self.npc_id.clone(),
            location: self.location().to_string(),
            quest_stage: self.quest_stage().to_string(),
            mood: npc
                .mood
                .clone()
                .or_else(|| profile.and_then(|p| p.npc_mood.clone()))
                .unwrap_or_else(|| "neutral".to_string()),
            relationship: npc
                .relationship
                .or_else(|| profile.and_then(|p| p.relationship))
                .map(|v| format!("{v}"))
                .unwrap_or_else(|| "0".to_string()),
            trust: npc
                .trust
                .map(|v| format!("{v}"))
                .unwrap_or_else(|| "0".to_string()),
            reputation: self
                .snapshot
                .player_state
                .reputation
                .clone()
                .unwrap_or_else(|| "average".to_string()),
            style: npc
                .style
                .clone()
                .or_else(|| profile.and_then(|p| p.dialogue_style.clone()))
                .unwrap_or_else(|| "neutral".to_string()),
        }
    }

    /// The last `window` history turns as role-prefixed lines.
    pub fn history_lines(&self, window: usize) -> Vec<String> {
        let history = &self.snapshot.dialogue_history;
        let start = history.len().saturating_sub(window);
        history[start..]
            .iter()
            .flat_map(|turn| {
                [
                    format!("Player: {}", turn.player),
                    format!("NPC: {}", turn.npc),
                ]
            })
            .collect()
    }

    /// NPC emotion scores as `name:score` pairs, strongest first.
    pub fn emotion_summary(&self) -> String {
        let mut emotions: Vec<_> = self.snapshot.npc_state.emotions.iter().collect();
        emotions.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        emotions
            .iter()
            .map(|(name, score)| format!("{name}:{score:.2}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
