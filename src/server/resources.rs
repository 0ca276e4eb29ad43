// Read-only resources advertised through `resources/list`.
//
// Everything here is a JSON snapshot built from configuration; nothing
// secret (API keys, credential contents) is ever included.

use serde_json::{json, Map, Value};

use super::protocol::Resource;
use crate::core::agent::agent_config::{FIELD_KEYWORDS, RESTRICTION_KEYWORDS};
use crate::core::agent::formatting::AgentStatus;
use crate::core::agent::{AgentConfig, PipelineState};

pub const AGENT_CONFIG_URI: &str = "config://agent-config";
pub const API_FIELDS_URI: &str = "config://api-fields";
pub const CURRENT_STATE_URI: &str = "state://current-state";

const USAGE_EXAMPLES: [&str; 3] = [
    "récupère 5 posts avec title et id",
    "obtiens 10 posts avec tous les champs",
    "prends 3 posts avec seulement le title",
];

pub fn resource_catalog() -> Vec<Resource> {
    vec![
        Resource {
            uri: AGENT_CONFIG_URI,
            name: "Agent configuration",
            description: "Current configuration of the API to Sheets agent",
            mime_type: "application/json",
        },
        Resource {
            uri: API_FIELDS_URI,
            name: "Available API fields",
            description: "Fields that can be requested, with keywords and example requests",
            mime_type: "application/json",
        },
        Resource {
            uri: CURRENT_STATE_URI,
            name: "Initial state",
            description: "The pipeline state a new run starts from",
            mime_type: "application/json",
        },
    ]
}

/// `None` for an unknown URI.
pub fn read_resource(uri: &str, config: &AgentConfig, status: &AgentStatus) -> Option<Value> {
    match uri {
        AGENT_CONFIG_URI => Some(agent_config_json(config, status)),
        API_FIELDS_URI => Some(api_fields_json(config)),
        CURRENT_STATE_URI => Some(
            serde_json::to_value(PipelineState::initial(config)).unwrap_or(Value::Null),
        ),
        _ => None,
    }
}

fn agent_config_json(config: &AgentConfig, status: &AgentStatus) -> Value {
    json!({
        "default_api_url": config.default_api_url,
        "default_limit": config.limits.default,
        "min_limit": config.limits.min,
        "max_limit": config.limits.max,
        "valid_fields": config.all_fields(),
        "model": config.openai.model,
        "temperature": config.openai.temperature,
        "api_timeout_secs": config.api_timeout.as_secs(),
        "max_retries": config.max_retries,
        "sheets": {
            "folder_name": config.sheets.folder_name,
            "title_prefix": config.sheets.title_prefix,
            "share_publicly": config.sheets.share_publicly,
            "personal_email_set": config.sheets.personal_email.is_some(),
        },
        "integrations": {
            "extractor": status.extractor_configured,
            "google_sheets": status.sheets_configured,
        },
    })
}

fn api_fields_json(config: &AgentConfig) -> Value {
    let keywords: Map<String, Value> = FIELD_KEYWORDS
        .iter()
        .map(|(field, words)| (field.to_string(), json!(words)))
        .collect();

    json!({
        "valid_fields": config.all_fields(),
        "field_descriptions": {
            "userId": "ID of the author",
            "id": "Unique post ID",
            "title": "Post title",
            "body": "Post content",
        },
        "field_keywords": keywords,
        "restriction_keywords": RESTRICTION_KEYWORDS,
        "usage_examples": USAGE_EXAMPLES,
    })
}
