//! Minimal client for the NPC model-serving API.
//!
//! This crate provides a focused client for the dialogue model server with:
//! - Main-path generation (`/predict_main`) including head-predicted
//!   deltas and per-flag probabilities/thresholds
//! - Fallback generation (`/predict_fallback`)
//! - Batch sentence embedding (`/encode`)

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const MAIN_PATH: &str = "/predict_main";
const FALLBACK_PATH: &str = "/predict_fallback";
const ENCODE_PATH: &str = "/encode";

/// Default request timeout, matching the serving deployment.
const DEFAULT_TIMEOUT_SECS: u64 = 25;

/// Errors that can occur when using the serving client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serving URL not configured")]
    NoBaseUrl,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Model-serving API client.
#[derive(Clone)]
pub struct HfServe {
    client: reqwest::Client,
    base_url: String,
    params: GenParams,
}

impl HfServe {
    /// Create a new client for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            params: GenParams::default(),
        }
    }

    /// Create a client from the `HF_SERVE_URL` environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let base_url = std::env::var("HF_SERVE_URL").map_err(|_| Error::NoBaseUrl)?;
        Ok(Self::new(base_url))
    }

    /// Set the default generation parameters for this client.
    pub fn with_params(mut self, params: GenParams) -> Self {
        self.params = params;
        self
    }

    /// The default generation parameters.
    pub fn params(&self) -> &GenParams {
        &self.params
    }

    /// Run main-path generation for an assembled prompt.
    ///
    /// The response carries the generated text plus whatever the serving
    /// model's prediction heads produced; servers without heads return
    /// empty maps.
    pub async fn predict_main(&self, request: MainRequest) -> Result<MainResponse, Error> {
        let body = ApiMainRequest {
            session_id: request.session_id,
            npc_id: request.npc_id,
            prompt: request.prompt,
            params: request.params.unwrap_or_else(|| self.params.clone()),
        };
        self.post(MAIN_PATH, &body).await
    }

    /// Run fallback-path generation for an assembled prompt.
    pub async fn predict_fallback(&self, request: FallbackRequest) -> Result<FallbackResponse, Error> {
        let body = ApiFallbackRequest {
            session_id: request.session_id,
            npc_id: request.npc_id,
            prompt: request.prompt,
            params: request.params.unwrap_or_else(|| self.params.clone()),
        };
        self.post(FALLBACK_PATH, &body).await
    }

    /// Embed a batch of texts, one vector per input in order.
    pub async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let body = ApiEncodeRequest { texts };
        let response: ApiEncodeResponse = self.post(ENCODE_PATH, &body).await?;
        Ok(response.vectors)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, Error> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .headers(Self::headers())
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }

        response.json().await.map_err(|e| Error::Parse(e.to_string()))
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

// ============================================================================
// Public types
// ============================================================================

/// Sampling parameters for generation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub do_sample: bool,
}

impl Default for GenParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 220,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: 1.05,
            do_sample: true,
        }
    }
}

impl GenParams {
    pub fn with_max_new_tokens(mut self, max: usize) -> Self {
        self.max_new_tokens = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }
}

/// A main-path generation request.
#[derive(Debug, Clone)]
pub struct MainRequest {
    pub session_id: String,
    pub npc_id: String,
    pub prompt: String,
    pub params: Option<GenParams>,
}

impl MainRequest {
    /// Create a request with the client's default parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            session_id: String::new(),
            npc_id: String::new(),
            prompt: prompt.into(),
            params: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_npc(mut self, npc_id: impl Into<String>) -> Self {
        self.npc_id = npc_id.into();
        self
    }

    pub fn with_params(mut self, params: GenParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// Response from main-path generation.
///
/// `deltas`, `flags_prob`, and `flags_thr` come from the serving model's
/// prediction heads pooled over state tokens; all three are optional in
/// the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainResponse {
    pub npc_output_text: String,
    #[serde(default)]
    pub deltas: Option<HeadDeltas>,
    #[serde(default)]
    pub flags_prob: HashMap<String, f32>,
    #[serde(default)]
    pub flags_thr: HashMap<String, f32>,
}

/// Head-predicted per-turn deltas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeadDeltas {
    pub trust: f32,
    pub relationship: f32,
}

/// A fallback-path generation request.
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub session_id: String,
    pub npc_id: String,
    pub prompt: String,
    pub params: Option<GenParams>,
}

impl FallbackRequest {
    /// Create a request with the client's default parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            session_id: String::new(),
            npc_id: String::new(),
            prompt: prompt.into(),
            params: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_npc(mut self, npc_id: impl Into<String>) -> Self {
        self.npc_id = npc_id.into();
        self
    }
}

/// Response from fallback-path generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackResponse {
    pub text: String,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiMainRequest {
    session_id: String,
    npc_id: String,
    prompt: String,
    #[serde(flatten)]
    params: GenParams,
}

#[derive(Debug, Serialize)]
struct ApiFallbackRequest {
    session_id: String,
    npc_id: String,
    prompt: String,
    #[serde(flatten)]
    params: GenParams,
}

#[derive(Debug, Serialize)]
struct ApiEncodeRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ApiEncodeResponse {
    vectors: Vec<Vec<f32>>,
}
