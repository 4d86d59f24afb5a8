//! Wire types shared by the registry, the scheduler and the dispatcher.
//!
//! Backends register themselves with a [`NodeInfo`], report load through the stats channel
//! (parsed into [`NodeStats`]), and receive [`GenerationRequest`] payloads serialised with
//! default-valued fields left out.
use bon::Builder;
use serde::{Deserialize, Serialize};

/// A registered inference backend. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct NodeInfo {
    #[builder(into)]
    pub ip: String,
    pub port: u16,
    #[builder(default, into)]
    #[serde(default)]
    pub model_path: String,
    #[builder(default)]
    #[serde(default)]
    pub is_generation: bool,
    /// Port of the node's stats channel. Zero disables stats ingestion.
    #[builder(default)]
    #[serde(default, rename = "controller_info_port")]
    pub stats_port: u16,
}

impl NodeInfo {
    /// The `ip:port` key this node's stats are stored under.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn reports_stats(&self) -> bool {
        self.stats_port != 0
    }

    pub fn stats_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.ip, self.stats_port)
    }
}

/// The latest load report received from a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub available_memory: u64,
    pub num_running: u64,
    pub num_waiting: u64,
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

/// Body of `/v1/completions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRequest {
    #[serde(skip_serializing_if = "is_default")]
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "is_default")]
    pub best_of: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub stream: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub ignore_eos: bool,
}

/// Sampling knobs nested in a [`GenerateRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "is_default")]
    pub skip_special_tokens: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub spaces_between_special_tokens: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub max_new_tokens: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub min_new_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_token_ids: Vec<u32>,
    pub temperature: f64,
    #[serde(skip_serializing_if = "is_default")]
    pub top_p: f64,
    #[serde(skip_serializing_if = "is_default")]
    pub top_k: i32,
    #[serde(skip_serializing_if = "is_default")]
    pub min_p: f64,
    #[serde(skip_serializing_if = "is_default")]
    pub frequency_penalty: f64,
    #[serde(skip_serializing_if = "is_default")]
    pub presence_penalty: f64,
    #[serde(skip_serializing_if = "is_default")]
    pub ignore_eos: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
}

/// Body of `/generate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    pub text: String,
    pub sampling_params: SamplingParams,
}

/// A request the dispatcher can forward to a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationRequest {
    Completion(CompletionRequest),
    Generate(GenerateRequest),
}

impl GenerationRequest {
    /// Serialises the request into the JSON body posted to the backend.
    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            GenerationRequest::Completion(request) => serde_json::to_vec(request),
            GenerationRequest::Generate(request) => serde_json::to_vec(request),
        }
    }
}

impl From<CompletionRequest> for GenerationRequest {
    fn from(request: CompletionRequest) -> Self {
        GenerationRequest::Completion(request)
    }
}

impl From<GenerateRequest> for GenerationRequest {
    fn from(request: GenerateRequest) -> Self {
        GenerationRequest::Generate(request)
    }
}
