//! Response reconciliation.
//!
//! Fuses three signal families into final deltas and flags: what the model
//! predicted (head probabilities and inline tags), what retrieval says the
//! narrative expects (reference scores, expected deltas, examples), and
//! embedding similarity between the turn and curated example sentences.
//! The retrieved expectation corrects the model when the narrative context
//! strongly supports it; it never simply overrides.

use crate::config::ReconcilerConfig;
use crate::context::ContextParser;
use crate::knowledge::{DeltaVector, DocKind, FlagDefDoc, KnowledgeBundle, TriggerMetaDoc};
use crate::prompt::PromptBuilder;
use crate::providers::{
    cosine_similarity, Embedder, Generation, GenerationMode, ProviderError, TextGenerator,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Flags that resolve to a textual value when decided on.
pub const VALUE_FLAGS: [&str; 4] = [
    "give_item",
    "npc_action",
    "change_player_state",
    "change_game_state",
];

/// Fixed weight of embedding similarity in the blended flag score.
const EMBED_WEIGHT: f32 = 0.2;

/// Penalties when a reconciled delta sign contradicts the expected sign.
const TRUST_PENALTY: f32 = 0.06;
const RELATIONSHIP_PENALTY: f32 = 0.08;

/// Example-sentence weights by source document kind.
const WEIGHT_FLAG_DEF: f32 = 1.0;
const WEIGHT_TRIGGER_META: f32 = 0.7;
const WEIGHT_PERSONA: f32 = 0.5;

/// Per-flag diagnostic breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct FlagDetail {
    pub model_prob: f32,
    pub model_thr: f32,
    pub rag_score: f32,
    pub embed_sim: f32,
    pub penalty: f32,
    pub blended: f32,
    pub threshold: f32,
    /// Whether the near-boundary consistency check fell back to the raw
    /// reference score.
    pub used_rag: bool,
    /// The score that was actually compared against the threshold.
    pub score: f32,
    pub decision: u8,
}

/// Final reconciled output for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciledResult {
    pub text: String,
    pub deltas: DeltaVector,
    pub flags: BTreeMap<String, u8>,
    pub valid: bool,
    pub detail: BTreeMap<String, FlagDetail>,
    pub values: BTreeMap<String, String>,
    pub value_contexts: BTreeMap<String, Vec<String>>,
}

/// A raw attribute from a `<DELTA .../>` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaValue {
    Number(f32),
    Text(String),
}

/// Reconciles generated output with retrieved reference data.
pub struct ResponseReconciler {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn TextGenerator>,
    config: ReconcilerConfig,
    rng: Mutex<StdRng>,
}

impl ResponseReconciler {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        config: ReconcilerConfig,
        jitter_seed: Option<u64>,
    ) -> Self {
        let rng = match jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            embedder,
            generator,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Full main-path reconciliation.
    pub async fn reconcile(
        &self,
        raw_text: &str,
        input: &str,
        ctx: &ContextParser,
        bundle: &KnowledgeBundle,
        payload: &Generation,
        prompts: &PromptBuilder,
    ) -> Result<ReconciledResult, ProviderError> {
        let (candidate, had_tag) = extract_response(raw_text);
        let delta_attrs = extract_delta_attrs(raw_text);
        let tag_scores = extract_flag_scores(raw_text);

        let flag_defs: Vec<&FlagDefDoc> = bundle.flag_defs();
        let flag_names: Vec<&str> = flag_defs.iter().map(|d| d.name.as_str()).collect();

        // Deltas first: the flag penalty reads the reconciled signs.
        let context_text = format!("{input} {candidate} {}", flag_names.join(" "));
        let deltas = self
            .reconcile_deltas(&delta_attrs, payload, &context_text, bundle)
            .await;

        let (flags, detail) = self
            .reconcile_flags(&flag_defs, &tag_scores, payload, &candidate, &deltas, bundle)
            .await;

        let mut values = BTreeMap::new();
        let mut value_contexts = BTreeMap::new();
        for name in VALUE_FLAGS {
            if flags.get(name) == Some(&1) {
                if let Some(value) = bundle.latest_flag_value(name) {
                    value_contexts.insert(name.to_string(), bundle.value_contexts(value));
                    values.insert(name.to_string(), value.to_string());
                }
            }
        }

        let verify_prompt =
            prompts.verify(&candidate, input, ctx, bundle, &deltas, &flags, &values, &value_contexts);
        let verified = self
            .generator
            .generate(GenerationMode::Main, &verify_prompt)
            .await?;
        let text = first_line(&verified.text)
            .unwrap_or(candidate.as_str())
            .to_string();

        Ok(ReconciledResult {
            text,
            deltas,
            flags,
            valid: had_tag,
            detail,
            values,
            value_contexts,
        })
    }

    /// Restricted reconciliation for recognized fallback triggers: the
    /// turn's delta is the trigger's fixed delta and no flags are
    /// extracted; the text is only checked for alignment with the
    /// trigger's expected action and emotion.
    pub async fn reconcile_restricted(
        &self,
        raw_text: &str,
        meta: &TriggerMetaDoc,
    ) -> ReconciledResult {
        let (candidate, _) = extract_response(raw_text);
        let deltas = meta.delta.clamped();

        let expectations: Vec<String> = [meta.npc_action.clone(), meta.npc_emotion.clone()]
            .into_iter()
            .flatten()
            .collect();
        let valid = if expectations.is_empty() {
            true
        } else {
            match self.alignment(&candidate, &expectations).await {
                Ok(sim) => sim >= self.config.sim_threshold,
                Err(e) => {
                    warn!(error = %e, "alignment check failed, accepting fallback text");
                    true
                }
            }
        };

        ReconciledResult {
            text: candidate,
            deltas,
            flags: BTreeMap::new(),
            valid,
            detail: BTreeMap::new(),
            values: BTreeMap::new(),
            value_contexts: BTreeMap::new(),
        }
    }

    async fn alignment(&self, text: &str, expectations: &[String]) -> Result<f32, ProviderError> {
        let anchor = self.embedder.encode(text).await?;
        let vectors = self.embedder.encode_batch(expectations).await?;
        let best = vectors
            .iter()
            .map(|v| cosine_similarity(&anchor, v))
            .fold(f32::MIN, f32::max);
        Ok(best)
    }

    // ------------------------------------------------------------------
    // Deltas
    // ------------------------------------------------------------------

    async fn reconcile_deltas(
        &self,
        attrs: &BTreeMap<String, DeltaValue>,
        payload: &Generation,
        context_text: &str,
        bundle: &KnowledgeBundle,
    ) -> DeltaVector {
        let head = payload.deltas.unwrap_or_default();
        let mut trust = numeric_attr(attrs, "trust").unwrap_or(head.trust);
        let mut relationship = numeric_attr(attrs, "relationship").unwrap_or(head.relationship);

        let expected = bundle.trigger_def().map(|d| &d.delta_expected);
        if let Some(expected) = expected {
            if !expected.is_empty() {
                match self.context_support(context_text, bundle).await {
                    Ok(gap) => {
                        if gap >= self.config.sim_threshold - 0.1 {
                            if let Some(e) = expected.get("trust") {
                                trust = self.pull_toward(trust, *e);
                            }
                            if let Some(e) = expected.get("relationship") {
                                relationship = self.pull_toward(relationship, *e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "context-support embedding failed, keeping raw deltas");
                    }
                }
            }
        }

        DeltaVector::new(trust, relationship)
    }

    /// Bias a raw delta toward the expected value when it diverges enough.
    fn pull_toward(&self, raw: f32, expected: f32) -> f32 {
        if (raw - expected).abs() > self.config.diff_threshold {
            self.config.blend * expected + (1.0 - self.config.blend) * raw
        } else {
            raw
        }
    }

    /// Positive-minus-negative weighted similarity of the turn context
    /// against curated example sentences.
    async fn context_support(
        &self,
        context_text: &str,
        bundle: &KnowledgeBundle,
    ) -> Result<f32, ProviderError> {
        let anchor = self.embedder.encode(context_text).await?;
        let (positives, negatives) = polarity_examples(bundle);
        let pos = self.weighted_similarity(&anchor, &positives).await?;
        let neg = self.weighted_similarity(&anchor, &negatives).await?;
        Ok(pos - neg)
    }

    async fn weighted_similarity(
        &self,
        anchor: &[f32],
        examples: &[(String, f32)],
    ) -> Result<f32, ProviderError> {
        if examples.is_empty() {
            return Ok(0.0);
        }
        let texts: Vec<String> = examples.iter().map(|(t, _)| t.clone()).collect();
        let vectors = self.embedder.encode_batch(&texts).await?;
        let mut weighted = 0.0;
        let mut total = 0.0;
        for ((_, weight), vector) in examples.iter().zip(&vectors) {
            weighted += weight * cosine_similarity(anchor, vector);
            total += weight;
        }
        Ok(weighted / total)
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    async fn reconcile_flags(
        &self,
        flag_defs: &[&FlagDefDoc],
        tag_scores: &BTreeMap<String, f32>,
        payload: &Generation,
        npc_text: &str,
        deltas: &DeltaVector,
        bundle: &KnowledgeBundle,
    ) -> (BTreeMap<String, u8>, BTreeMap<String, FlagDetail>) {
        let mut flags = BTreeMap::new();
        let mut detail = BTreeMap::new();
        if flag_defs.is_empty() {
            return (flags, detail);
        }

        let npc_vec = match self.embedder.encode(npc_text).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                warn!(error = %e, "npc text embedding failed, scoring flags without similarity");
                None
            }
        };

        // Cosine between the model's and retrieval's score vectors over
        // all known flags; low values mean the patterns disagree.
        let mut model_vec = Vec::with_capacity(flag_defs.len());
        let mut rag_vec = Vec::with_capacity(flag_defs.len());
        for def in flag_defs {
            model_vec.push(model_prob(&def.name, payload, tag_scores));
            rag_vec.push(def.rag_score);
        }
        let vector_consistency = cosine_similarity(&model_vec, &rag_vec);

        let expected = bundle.trigger_def().map(|d| d.delta_expected.clone()).unwrap_or_default();
        let cfg = &self.config;

        for def in flag_defs {
            let model_prob = model_prob(&def.name, payload, tag_scores);
            let model_thr = payload.flags_thr.get(&def.name).copied().unwrap_or(0.5);

            let embed_sim = match (&npc_vec, def.examples_positive.is_empty()) {
                (Some(anchor), false) => {
                    let examples: Vec<(String, f32)> = def
                        .examples_positive
                        .iter()
                        .map(|t| (t.clone(), 1.0))
                        .collect();
                    match self.weighted_similarity(anchor, &examples).await {
                        Ok(sim) => sim,
                        Err(e) => {
                            warn!(flag = %def.name, error = %e, "example embedding failed");
                            0.0
                        }
                    }
                }
                _ => 0.0,
            };

            let mut penalty = 0.0;
            if sign_contradicts(deltas.trust, expected.get("trust")) {
                penalty += TRUST_PENALTY;
            }
            if sign_contradicts(deltas.relationship, expected.get("relationship")) {
                penalty += RELATIONSHIP_PENALTY;
            }

            let blended = cfg.alpha_model * model_prob
                + (1.0 - cfg.alpha_model) * def.rag_score
                + EMBED_WEIGHT * embed_sim
                - penalty;
            let threshold = cfg.alpha_model * model_thr + (1.0 - cfg.alpha_model) * 0.5;

            let near_boundary = (blended - threshold).abs() <= cfg.margin;
            let used_rag = near_boundary && vector_consistency < cfg.sim_threshold;
            let mut score = if used_rag { def.rag_score } else { blended };

            // Calibration smoothing only; jitter stays below the margin so
            // it can never flip a decision outside the boundary band.
            if (score - def.rag_score).abs() > f32::EPSILON {
                let jitter = self
                    .rng
                    .lock()
                    .expect("jitter rng poisoned")
                    .gen_range(-cfg.random_jitter..=cfg.random_jitter);
                score = (score + jitter).clamp(0.0, 1.0);
            }

            let decision = u8::from(score >= threshold);
            debug!(flag = %def.name, score, threshold, decision, "flag decided");

            flags.insert(def.name.clone(), decision);
            detail.insert(
                def.name.clone(),
                FlagDetail {
                    model_prob,
                    model_thr,
                    rag_score: def.rag_score,
                    embed_sim,
                    penalty,
                    blended,
                    threshold,
                    used_rag,
                    score,
                    decision,
                },
            );
        }

        (flags, detail)
    }
}

/// Model-predicted probability for a flag: prediction head first, inline
/// tag second, 0.0 when neither is present.
fn model_prob(name: &str, payload: &Generation, tag_scores: &BTreeMap<String, f32>) -> f32 {
    payload
        .flags_prob
        .get(name)
        .or_else(|| tag_scores.get(name))
        .copied()
        .unwrap_or(0.0)
}

fn sign_contradicts(actual: f32, expected: Option<&f32>) -> bool {
    match expected {
        Some(expected) => actual * expected < 0.0,
        None => false,
    }
}

fn numeric_attr(attrs: &BTreeMap<String, DeltaValue>, key: &str) -> Option<f32> {
    match attrs.get(key) {
        Some(DeltaValue::Number(v)) => Some(*v),
        _ => None,
    }
}

/// Example sentences for context support, weighted by source kind.
fn polarity_examples(bundle: &KnowledgeBundle) -> (Vec<(String, f32)>, Vec<(String, f32)>) {
    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    for def in bundle.flag_defs() {
        for text in &def.examples_positive {
            positives.push((text.clone(), WEIGHT_FLAG_DEF));
        }
        for text in &def.examples_negative {
            negatives.push((text.clone(), WEIGHT_FLAG_DEF));
        }
    }
    for doc in bundle.of_kind(DocKind::TriggerMeta) {
        if !doc.text.is_empty() {
            positives.push((doc.text.clone(), WEIGHT_TRIGGER_META));
        }
    }
    for kind in [DocKind::NpcPersona, DocKind::Description] {
        for doc in bundle.of_kind(kind) {
            if !doc.text.is_empty() {
                positives.push((doc.text.clone(), WEIGHT_PERSONA));
            }
        }
    }
    (positives, negatives)
}

// ============================================================================
// Tag extraction
// ============================================================================

/// Extract the candidate utterance. Without a `<RESPONSE>` tag the whole
/// trimmed text is the candidate and the turn is marked invalid.
pub fn extract_response(text: &str) -> (String, bool) {
    match extract_block(text, "RESPONSE") {
        Some(inner) => (inner.trim().to_string(), true),
        None => (text.trim().to_string(), false),
    }
}

/// Raw attributes of the first `<DELTA .../>` tag. Numeric-parseable
/// values become numbers; anything else stays text.
pub fn extract_delta_attrs(text: &str) -> BTreeMap<String, DeltaValue> {
    let mut attrs = BTreeMap::new();
    if let Some(raw) = extract_self_closing(text, "DELTA") {
        for (key, value) in parse_attrs(raw) {
            let parsed = match value.parse::<f32>() {
                Ok(number) => DeltaValue::Number(number),
                Err(_) => DeltaValue::Text(value),
            };
            attrs.insert(key, parsed);
        }
    }
    attrs
}

/// Numeric scores of the first `<FLAG .../>` tag; non-numeric attributes
/// are ignored.
pub fn extract_flag_scores(text: &str) -> BTreeMap<String, f32> {
    let mut scores = BTreeMap::new();
    if let Some(raw) = extract_self_closing(text, "FLAG") {
        for (key, value) in parse_attrs(raw) {
            if let Ok(number) = value.parse::<f32>() {
                scores.insert(key, number);
            }
        }
    }
    scores
}

fn extract_block<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

fn extract_self_closing<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag} ");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find("/>")? + start;
    Some(&text[start..end])
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = raw;
    while let Some(eq) = rest.find('=') {
        // attribute names never contain whitespace; keep the last token
        let key = rest[..eq]
            .trim()
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or("");
        let after = &rest[eq + 1..];
        let Some(quote_start) = after.find('"') else { break };
        let value_start = quote_start + 1;
        let Some(quote_len) = after[value_start..].find('"') else { break };
        let value = &after[value_start..value_start + quote_len];
        if !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            attrs.push((key.to_string(), value.to_string()));
        }
        rest = &after[value_start + quote_len + 1..];
    }
    attrs
}

/// The first non-empty line, trimmed.
fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_response_with_tag() {
        let text = "noise <RESPONSE> Take the key. </RESPONSE> <DELTA trust=\"0.2\" />";
        let (candidate, had_tag) = extract_response(text);
        assert_eq!(candidate, "Take the key.");
        assert!(had_tag);
    }

    #[test]
    fn test_extract_response_without_tag() {
        let (candidate, had_tag) = extract_response("  bare text  ");
        assert_eq!(candidate, "bare text");
        assert!(!had_tag);
    }

    #[test]
    fn test_extract_delta_attrs_mixed_types() {
        let attrs =
            extract_delta_attrs("<DELTA mood=\"calm\" trust=\"0.3\" relationship=\"-0.1\" />");
        assert_eq!(attrs["mood"], DeltaValue::Text("calm".to_string()));
        assert_eq!(attrs["trust"], DeltaValue::Number(0.3));
        assert_eq!(attrs["relationship"], DeltaValue::Number(-0.1));
    }

    #[test]
    fn test_extract_flag_scores() {
        let scores = extract_flag_scores("<FLAG give_item=\"0.82\" note=\"high\" />");
        assert_eq!(scores.len(), 1);
        assert_eq!(scores["give_item"], 0.82);
    }

    #[test]
    fn test_missing_tags_yield_empty_maps() {
        assert!(extract_delta_attrs("no tags here").is_empty());
        assert!(extract_flag_scores("no tags here").is_empty());
    }

    #[test]
    fn test_parse_attrs_ignores_malformed_keys() {
        let attrs = parse_attrs("good=\"1\" bad key=\"2\"");
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], ("good".to_string(), "1".to_string()));
        // "bad key" splits at the '='; only the trailing identifier counts
        assert_eq!(attrs[1], ("key".to_string(), "2".to_string()));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("\n\n  hello \nworld"), Some("hello"));
        assert_eq!(first_line("   \n  "), None);
    }

    #[test]
    fn test_sign_contradiction() {
        assert!(sign_contradicts(-0.2, Some(&0.3)));
        assert!(sign_contradicts(0.2, Some(&-0.3)));
        assert!(!sign_contradicts(0.2, Some(&0.3)));
        assert!(!sign_contradicts(0.0, Some(&0.3)));
        assert!(!sign_contradicts(0.2, None));
    }
}
