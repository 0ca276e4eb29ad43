use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::agent_config::AgentConfig;

/// A single fetched item: field name to scalar value, in source order.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
        }
    }
}

/// Well-formed request parameters.
///
/// Only [`validate_params`](super::param_validator::validate_params) and the
/// fallback builder produce these, so a value of this type always has a
/// bounded limit and a duplicate-free subset of the valid fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedParams {
    pub limit: u32,
    pub fields: Vec<String>,
    pub filters: Map<String, Value>,
    pub description: String,
}

impl ExtractedParams {
    /// Re-exposes the parameters as a JSON mapping, the same shape the
    /// extractor is asked to produce.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "limit": self.limit,
            "fields": self.fields,
            "filters": self.filters,
            "description": self.description,
        })
    }
}

/// Parameters as they reach the validator.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateParams {
    /// Already repaired.
    Validated(ExtractedParams),
    /// Whatever the extractor handed back: possibly not even an object.
    Untrusted(Value),
}

impl From<Value> for CandidateParams {
    fn from(value: Value) -> Self {
        CandidateParams::Untrusted(value)
    }
}

impl From<ExtractedParams> for CandidateParams {
    fn from(params: ExtractedParams) -> Self {
        CandidateParams::Validated(params)
    }
}

/// The record threaded through every pipeline stage.
///
/// Stages read what earlier stages wrote. Once `error` is set, every stage
/// except the response stage leaves the state alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    pub messages: Vec<ChatMessage>,
    pub api_url: String,
    pub user_query: String,
    pub extracted_params: Option<ExtractedParams>,
    pub api_data: Option<Vec<Record>>,
    pub processed_data: Option<Vec<Record>>,
    pub sheets_url: String,
    pub folder_url: Option<String>,
    pub error: Option<String>,
}

impl PipelineState {
    /// State before any utterance arrives: the configured endpoint and
    /// nothing else.
    pub fn initial(config: &AgentConfig) -> Self {
        Self {
            api_url: config.default_api_url.clone(),
            ..Self::default()
        }
    }

    /// Fresh state for one invocation, seeded with the user's utterance.
    pub fn new(config: &AgentConfig, utterance: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::human(utterance)],
            ..Self::initial(config)
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Most recent human-authored message, if any.
    pub fn latest_human_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Human)
            .map(|m| m.content.as_str())
    }

    /// Last agent reply, i.e. what the response stage rendered.
    pub fn final_response(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Agent)
            .map(|m| m.content.as_str())
    }
}
