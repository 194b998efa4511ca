//! QA tests for full turn flow through the orchestrator.
//!
//! These cover the branch behavior of a turn end to end with scripted
//! collaborators: main path on a satisfied trigger, recognized and
//! generic fallbacks, flag scoring without model signals, and value
//! resolution.

use npc_core::knowledge::{
    DeltaVector, DialogueTurnDoc, DocBody, FlagDefDoc, ForbiddenTriggerDoc, RequirementSet,
    TriggerDefDoc, TriggerMetaDoc, TriggerRule,
};
use npc_core::providers::{Generation, GenerationMode};
use npc_core::testing::{doc, TurnHarness};
use npc_core::GameStateSnapshot;

fn snapshot() -> GameStateSnapshot {
    serde_json::from_value(serde_json::json!({
        "require": {
            "items": ["old_key"],
            "delta": {"trust": 0.3}
        },
        "player_state": {"items": ["old_key", "sword"], "actions": []},
        "game_state": {"quest_stage": "stage_1", "location": "village"},
        "npc_state": {"mood": "wary", "trust": 0.4}
    }))
    .unwrap()
}

fn trigger_def() -> npc_core::KnowledgeDocument {
    doc(
        "trigger-1",
        "npc_001",
        DocBody::TriggerDef(TriggerDefDoc {
            trigger: TriggerRule {
                required_text: vec!["amulet".to_string()],
                required_items: Some(RequirementSet {
                    values: vec!["old_key".to_string()],
                    mandatory: vec!["old_key".to_string()],
                }),
                required_delta: Some(npc_core::knowledge::DeltaRequirement {
                    thresholds: [("trust".to_string(), 0.2)].into(),
                    mandatory: vec!["trust".to_string()],
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
    )
    .with_scope("stage_1", "village")
}

fn unit_vec(cosine: f32) -> Vec<f32> {
    vec![cosine, (1.0 - cosine * cosine).max(0.0).sqrt()]
}

// =============================================================================
// MAIN PATH
// =============================================================================

#[tokio::test]
async fn test_satisfied_trigger_takes_main_path() {
    let harness = TurnHarness::new(vec![trigger_def()]);
    harness.expect_generation(Generation::text(
        "<RESPONSE>Here, take it.</RESPONSE> <DELTA trust=\"0.4\" relationship=\"0.1\" />",
    ));
    harness.expect_generation(Generation::text("Here, take it."));

    let response = harness.turn("I brought the amulet", snapshot()).await.unwrap();

    assert!(response.valid);
    assert_eq!(response.npc_output_text, "Here, take it.");
    assert!((response.deltas.trust - 0.4).abs() < 1e-6);
    assert!((response.deltas.relationship - 0.1).abs() < 1e-6);
    assert!(!response.meta.additional_trigger);

    // main generation then verification, both on the main endpoint
    let prompts = harness.generator.prompts();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0].0, GenerationMode::Main);
    assert!(prompts[0].1.contains("<SYS>"));
    assert!(prompts[0].1.contains("<PLAYER>I brought the amulet</PLAYER>"));
    assert!(prompts[1].1.contains("CANDIDATE_RESPONSE:"));

    // the rule passed, so no semantic detection ran
    assert_eq!(harness.embedder.encode_calls(), 0);
}

#[tokio::test]
async fn test_missing_response_tag_marks_invalid() {
    let harness = TurnHarness::new(vec![trigger_def()]);
    harness.expect_generation(Generation::text("bare text without tags"));
    harness.expect_generation(Generation::text("bare text without tags"));

    let response = harness.turn("the amulet", snapshot()).await.unwrap();

    assert!(!response.valid);
    assert_eq!(response.npc_output_text, "bare text without tags");
    assert_eq!(response.deltas, DeltaVector::default());
}

// =============================================================================
// FALLBACK PATHS
// =============================================================================

#[tokio::test]
async fn test_recognized_forbidden_trigger_fallback() {
    let harness = TurnHarness::new(vec![
        trigger_def(),
        doc(
            "forbidden-1",
            "npc_001",
            DocBody::ForbiddenTriggerList(ForbiddenTriggerDoc {
                keywords: vec!["the dead child".to_string()],
                texts: vec![],
            }),
        ),
        doc(
            "meta-1",
            "npc_001",
            DocBody::TriggerMeta(TriggerMetaDoc {
                trigger: "the dead child".to_string(),
                npc_action: Some("turns away".to_string()),
                npc_emotion: Some("grief".to_string()),
                npc_style: None,
                delta: DeltaVector::new(-0.2, -0.1),
            }),
        ),
    ]);

    harness.embedder.add_vector("tell me about the dead child", vec![1.0, 0.0]);
    harness.embedder.add_vector("the dead child", unit_vec(0.81));
    harness.embedder.add_vector("I will not speak of it.", vec![1.0, 0.0]);
    harness.embedder.add_vector("turns away", unit_vec(0.3));
    harness.embedder.add_vector("grief", unit_vec(0.7));

    harness.expect_generation(Generation::text("I will not speak of it."));

    let response = harness
        .turn("tell me about the dead child", snapshot())
        .await
        .unwrap();

    assert!(response.meta.additional_trigger);
    assert!((response.meta.confidence.unwrap() - 0.81).abs() < 1e-4);
    let meta = response.meta.trigger_meta.as_ref().unwrap();
    assert_eq!(meta.trigger, "the dead child");

    // the turn's delta is the trigger's fixed delta, not model output
    assert!((response.deltas.trust + 0.2).abs() < 1e-6);
    assert!((response.deltas.relationship + 0.1).abs() < 1e-6);
    assert!(response.flags.is_empty());
    // text aligns with the expected emotion (0.7 >= sim threshold)
    assert!(response.valid);

    // single fallback generation, no verification pass
    let prompts = harness.generator.prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].0, GenerationMode::Fallback);
    assert!(prompts[0].1.contains("<FALLBACK>"));
    assert!(prompts[0].1.contains("recognized player utterance"));
}

#[tokio::test]
async fn test_generic_fallback_without_recognition() {
    let harness = TurnHarness::new(vec![trigger_def()]);
    // the input misses the keyword and no forbidden list exists
    harness.expect_generation(Generation::text("Move along."));

    let response = harness.turn("nice weather today", snapshot()).await.unwrap();

    assert!(!response.meta.additional_trigger);
    assert_eq!(response.npc_output_text, "Move along.");
    assert_eq!(response.deltas, DeltaVector::default());
    assert!(response.flags.is_empty());
    assert_eq!(harness.generator.prompts().len(), 1);
}

#[tokio::test]
async fn test_store_failure_degrades_to_fallback_turn() {
    let harness = TurnHarness::new(vec![]);
    // replace the store with one that always fails
    let orchestrator = npc_core::DialogueOrchestrator::new(
        std::sync::Arc::new(npc_core::testing::MemoryStore::failing()),
        std::sync::Arc::new(harness.embedder.clone()),
        std::sync::Arc::new(harness.generator.clone()),
        npc_core::PipelineConfig::default().with_jitter_seed(1),
    );
    harness.expect_generation(Generation::text("Hm?"));

    let response = orchestrator
        .handle_turn(npc_core::TurnRequest::new("sess", "npc_001", "hello", snapshot()))
        .await
        .unwrap();

    assert_eq!(response.npc_output_text, "Hm?");
    assert!(response.flags.is_empty());
}

// =============================================================================
// FLAG SCORING AND VALUE RESOLUTION
// =============================================================================

fn flag_docs() -> Vec<npc_core::KnowledgeDocument> {
    vec![
        trigger_def(),
        doc(
            "flag-give",
            "npc_001",
            DocBody::FlagDef(FlagDefDoc {
                name: "give_item".to_string(),
                threshold: 0.8,
                rag_score: 0.9,
                examples_positive: vec!["The NPC hands over the key.".to_string()],
                examples_negative: vec![],
            }),
        ),
        doc(
            "flag-action",
            "npc_001",
            DocBody::FlagDef(FlagDefDoc {
                name: "npc_action".to_string(),
                threshold: 0.8,
                rag_score: 0.1,
                examples_positive: vec![],
                examples_negative: vec![],
            }),
        ),
    ]
}

#[tokio::test]
async fn test_flags_without_model_signals_use_rag_and_similarity() {
    let harness = TurnHarness::new(flag_docs());
    harness.embedder.add_vector("Take the key.", vec![1.0, 0.0]);
    harness
        .embedder
        .add_vector("The NPC hands over the key.", vec![1.0, 0.0]);

    // no <FLAG> tag and no prediction heads: model_prob defaults to 0.0
    harness.expect_generation(Generation::text("<RESPONSE>Take the key.</RESPONSE>"));
    harness.expect_generation(Generation::text("Take the key."));

    let response = harness.turn("I brought the amulet", snapshot()).await.unwrap();

    // give_item: 0.4 * 0.9 + 0.2 * 1.0 = 0.56 against threshold 0.5
    assert_eq!(response.flags["give_item"], 1);
    // npc_action: 0.4 * 0.1 = 0.04 against threshold 0.5
    assert_eq!(response.flags["npc_action"], 0);

    let detail = &response.meta.flags_detail["give_item"];
    assert_eq!(detail.model_prob, 0.0);
    assert!((detail.rag_score - 0.9).abs() < 1e-6);
    assert!((detail.embed_sim - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn test_decided_flag_resolves_value_and_contexts() {
    let mut docs = flag_docs();
    docs.push(doc(
        "turn-3",
        "npc_001",
        DocBody::DialogueTurn(DialogueTurnDoc {
            turn_index: 3,
            flag_values: [("give_item".to_string(), "iron_key".to_string())].into(),
        }),
    ));
    docs.push(doc(
        "turn-5",
        "npc_001",
        DocBody::DialogueTurn(DialogueTurnDoc {
            turn_index: 5,
            flag_values: [("give_item".to_string(), "rusty_key".to_string())].into(),
        }),
    ));
    docs.push(
        doc("lore-key", "npc_001", DocBody::Lore)
            .with_text("The rusty_key opens the cellar door."),
    );

    let harness = TurnHarness::new(docs);
    harness.embedder.add_vector("Take the key.", vec![1.0, 0.0]);
    harness
        .embedder
        .add_vector("The NPC hands over the key.", vec![1.0, 0.0]);

    harness.expect_generation(Generation::text("<RESPONSE>Take the key.</RESPONSE>"));
    harness.expect_generation(Generation::text("Take the rusty key, friend."));

    let response = harness.turn("I brought the amulet", snapshot()).await.unwrap();

    assert_eq!(response.flags["give_item"], 1);
    // newest dialogue turn wins
    assert_eq!(response.meta.flags_values["give_item"], "rusty_key");
    let contexts = &response.meta.value_contexts["give_item"];
    assert!(contexts.iter().any(|c| c.contains("rusty_key")));
    // verification output is the final utterance
    assert_eq!(response.npc_output_text, "Take the rusty key, friend.");
}
