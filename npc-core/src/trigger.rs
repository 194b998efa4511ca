//! Two-stage trigger gate.
//!
//! Stage 1 evaluates the deterministic trigger rule for the current quest
//! stage and location. Only when that fails does stage 2 run: semantic
//! detection of forbidden triggers by embedding similarity, with a
//! generative yes/no confirmation inside the ambiguity band. Stage 2 can
//! recognize a special fallback but never re-validates the turn.

use crate::config::GateConfig;
use crate::context::{ContextParser, Require};
use crate::knowledge::{FallbackStyle, KnowledgeBundle, TriggerMetaDoc, TriggerRule};
use crate::providers::{cosine_similarity, Embedder, GenerationMode, TextGenerator};
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    /// Normalized tokens counted as an affirmative confirmation: `YES`,
    /// `Y`, Korean 예/네, and prefixes thereof.
    static ref AFFIRMATIVE_TOKENS: HashSet<&'static str> =
        ["Y", "YE", "YES", "예", "네"].into_iter().collect();
}

/// Result of gating a player utterance.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    /// Whether the deterministic trigger rule passed.
    pub is_valid: bool,
    /// Whether stage 2 recognized a forbidden trigger.
    pub additional_trigger: bool,
    /// The matched candidate string, when recognized.
    pub matched: Option<String>,
    /// Similarity score (or escalation score) behind the match.
    pub confidence: Option<f32>,
    /// Metadata for the matched trigger, when the bundle carries it.
    pub trigger_meta: Option<TriggerMetaDoc>,
    /// Style overrides for fallback generation.
    pub fallback_style: Option<FallbackStyle>,
}

impl GateOutcome {
    fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    fn fallback(style: Option<FallbackStyle>) -> Self {
        Self {
            fallback_style: style,
            ..Default::default()
        }
    }
}

/// The gate itself; stateless apart from its collaborators.
pub struct TriggerGate {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn TextGenerator>,
    config: GateConfig,
}

impl TriggerGate {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        config: GateConfig,
    ) -> Self {
        Self {
            embedder,
            generator,
            config,
        }
    }

    /// Evaluate a player utterance against the current knowledge bundle.
    ///
    /// Collaborator failures on the stage-2 path resolve conservatively to
    /// "no match"; this method never fails the turn.
    pub async fn evaluate(
        &self,
        input: &str,
        ctx: &ContextParser,
        bundle: &KnowledgeBundle,
    ) -> GateOutcome {
        let require = ctx.require();

        // Stage 1: the bundle's trigger definition, falling back to the
        // per-stage rule shipped in the NPC profile.
        let (rule, style) = match bundle.trigger_def() {
            Some(def) => (Some(&def.trigger), def.fallback_style.clone()),
            None => (ctx.profile_rule(), None),
        };

        if let Some(rule) = rule {
            if rule_passes(rule, input, &require) {
                debug!(npc_id = %ctx.npc_id(), "trigger rule satisfied");
                return GateOutcome::valid();
            }
        }

        self.stage_two(input, bundle, style).await
    }

    async fn stage_two(
        &self,
        input: &str,
        bundle: &KnowledgeBundle,
        style: Option<FallbackStyle>,
    ) -> GateOutcome {
        let Some(forbidden) = bundle.forbidden() else {
            return GateOutcome::fallback(style);
        };
        if forbidden.keywords.is_empty() && forbidden.texts.is_empty() {
            return GateOutcome::fallback(style);
        }

        let input_vec = match self.embedder.encode(input).await {
            Ok(vec) => vec,
            Err(e) => {
                warn!(error = %e, "input embedding failed, skipping semantic detection");
                return GateOutcome::fallback(style);
            }
        };

        let keyword_best = self.best_match(&input_vec, &forbidden.keywords).await;
        let text_best = self.best_match(&input_vec, &forbidden.texts).await;

        let (matched, confidence) = match self
            .decide(input, keyword_best, text_best)
            .await
        {
            Some(hit) => hit,
            None => return GateOutcome::fallback(style),
        };

        let trigger_meta = bundle.trigger_meta(&matched).cloned();
        debug!(%matched, confidence, "forbidden trigger recognized");

        GateOutcome {
            is_valid: false,
            additional_trigger: true,
            matched: Some(matched),
            confidence: Some(confidence),
            trigger_meta,
            fallback_style: style,
        }
    }

    /// Per-list maximum cosine score and its candidate.
    async fn best_match(&self, input_vec: &[f32], candidates: &[String]) -> Option<(f32, String)> {
        if candidates.is_empty() {
            return None;
        }
        let vectors = match self.embedder.encode_batch(candidates).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(error = %e, "candidate embedding failed");
                return None;
            }
        };
        candidates
            .iter()
            .zip(&vectors)
            .map(|(candidate, vec)| (cosine_similarity(input_vec, vec), candidate.clone()))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
    }

    async fn decide(
        &self,
        input: &str,
        keyword_best: Option<(f32, String)>,
        text_best: Option<(f32, String)>,
    ) -> Option<(String, f32)> {
        let keyword_score = keyword_best.as_ref().map(|(s, _)| *s).unwrap_or(f32::MIN);
        let text_score = text_best.as_ref().map(|(s, _)| *s).unwrap_or(f32::MIN);

        if keyword_score >= text_score {
            if let Some((score, candidate)) = keyword_best.as_ref() {
                if band(*score, &self.config) == MatchBand::Direct {
                    return Some((candidate.clone(), *score));
                }
            }
        }
        if let Some((score, candidate)) = text_best.as_ref() {
            if band(*score, &self.config) == MatchBand::Direct {
                return Some((candidate.clone(), *score));
            }
        }

        let (overall_score, overall_candidate) = if keyword_score >= text_score {
            (keyword_score, keyword_best.as_ref().map(|(_, c)| c.clone()))
        } else {
            (text_score, text_best.as_ref().map(|(_, c)| c.clone()))
        };
        if band(overall_score, &self.config) != MatchBand::Escalate {
            return None;
        }

        let prompt = escalation_prompt(
            input,
            keyword_best.as_ref().map(|(_, c)| c.as_str()),
            text_best.as_ref().map(|(_, c)| c.as_str()),
        );
        match self.generator.generate(GenerationMode::Main, &prompt).await {
            Ok(generation) if is_affirmative(&generation.text) => {
                overall_candidate.map(|candidate| (candidate, overall_score))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "escalation call failed, treating as no match");
                None
            }
        }
    }
}

/// Similarity band for a candidate score. Both thresholds are inclusive
/// at the lower edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchBand {
    Direct,
    Escalate,
    Below,
}

fn band(score: f32, config: &GateConfig) -> MatchBand {
    if score >= config.direct_threshold {
        MatchBand::Direct
    } else if score >= config.escalate_threshold {
        MatchBand::Escalate
    } else {
        MatchBand::Below
    }
}

/// Check a conjunctive trigger rule: every present mandatory clause must
/// pass.
pub fn rule_passes(rule: &TriggerRule, input: &str, require: &Require) -> bool {
    if !rule.required_text.is_empty() && !rule.required_text.iter().any(|kw| input.contains(kw.as_str())) {
        return false;
    }

    let subset_ok = |set: &Option<crate::knowledge::RequirementSet>, have: &HashSet<String>| {
        set.as_ref()
            .map(|s| s.mandatory.iter().all(|v| have.contains(v)))
            .unwrap_or(true)
    };

    if !subset_ok(&rule.required_items, &require.items) {
        return false;
    }
    if !subset_ok(&rule.required_actions, &require.actions) {
        return false;
    }
    if !subset_ok(&rule.required_game_state, &require.game_state) {
        return false;
    }

    if let Some(delta) = &rule.required_delta {
        for key in &delta.mandatory {
            let threshold = delta.thresholds.get(key).copied().unwrap_or(0.0);
            match require.delta.get(key) {
                Some(value) if *value >= threshold => {}
                _ => return false,
            }
        }
    }

    true
}

/// Strict yes/no semantic-equivalence question for the escalation band.
fn escalation_prompt(input: &str, keyword: Option<&str>, text: Option<&str>) -> String {
    let mut candidates = String::new();
    if let Some(keyword) = keyword {
        candidates.push_str(&format!("- \"{keyword}\"\n"));
    }
    if let Some(text) = text {
        candidates.push_str(&format!("- \"{text}\"\n"));
    }
    format!(
        "Decide whether the player utterance means the same thing as any of the \
candidate phrases below.\n\n\
Player utterance: \"{input}\"\n\n\
Candidates:\n{candidates}\n\
Answer with exactly YES or NO. Answer NO if you are unsure."
    )
}

/// Whether a generated confirmation counts as affirmative.
///
/// Only the first token is considered; anything ambiguous is negative.
fn is_affirmative(response: &str) -> bool {
    let token = response
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| c.is_ascii_punctuation() || c == '"' || c == '\u{201c}' || c == '\u{201d}');
    if token.is_empty() {
        return false;
    }
    let upper = token.to_uppercase();
    AFFIRMATIVE_TOKENS.contains(upper.as_str())
}
