//! Pipeline configuration.
//!
//! All thresholds here are hand-tuned calibration values, not invariants:
//! raising a threshold always makes the corresponding check stricter.

/// Configuration for a dialogue pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How many recent history turns the prompts include.
    pub history_window: usize,

    /// Per-variant retrieval cap when loading a knowledge bundle.
    pub bundle_top_k: usize,

    /// Bundle cache capacity per NPC (LRU beyond this).
    pub cache_capacity: usize,

    /// Trigger gate thresholds.
    pub gate: GateConfig,

    /// Reconciliation constants.
    pub reconciler: ReconcilerConfig,

    /// Seed for the reconciliation jitter source. Fixing this makes every
    /// flag decision reproducible.
    pub jitter_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_window: 8,
            bundle_top_k: 50,
            cache_capacity: 64,
            gate: GateConfig::default(),
            reconciler: ReconcilerConfig::default(),
            jitter_seed: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }
}

/// Thresholds for semantic forbidden-trigger detection.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Cosine similarity at or above this is a direct match.
    pub direct_threshold: f32,

    /// Cosine similarity at or above this (but below direct) escalates to
    /// a generative yes/no confirmation.
    pub escalate_threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            direct_threshold: 0.75,
            escalate_threshold: 0.65,
        }
    }
}

/// Constants for multi-signal flag and delta reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Weight of the model-predicted probability in the blended score;
    /// the retrieved reference score gets the complement.
    pub alpha_model: f32,

    /// Blend ratio when pulling a delta toward its expected value.
    pub blend: f32,

    /// Context-support similarity floor (the delta correction fires at
    /// `sim_threshold - 0.1`; the score-vector consistency check uses it
    /// directly).
    pub sim_threshold: f32,

    /// Minimum raw-vs-expected divergence before a delta is corrected.
    pub diff_threshold: f32,

    /// Half-width of the near-decision-boundary band.
    pub margin: f32,

    /// Symmetric jitter applied when the decided score departs from the
    /// raw reference score.
    pub random_jitter: f32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            alpha_model: 0.6,
            blend: 0.6,
            sim_threshold: 0.55,
            diff_threshold: 0.3,
            margin: 0.05,
            random_jitter: 0.02,
        }
    }
}
