//! Human-readable summaries of a pipeline run.
//!
//! Everything here is plain string formatting over values that already
//! exist, with defaults for anything missing, so rendering cannot fail.

use super::agent_config::AgentConfig;
use super::agent_models::{ExtractedParams, PipelineState};

const NOT_AVAILABLE: &str = "Not available";

/// Snapshot of what is configured, for the status tool.
#[derive(Debug, Clone, Default)]
pub struct AgentStatus {
    pub model: String,
    pub extractor_configured: bool,
    pub sheets_configured: bool,
    pub default_api: String,
    pub valid_fields: Vec<String>,
    pub default_limit: u32,
}

impl AgentStatus {
    pub fn ready(&self) -> bool {
        self.extractor_configured && self.sheets_configured
    }
}

fn check(flag: bool) -> &'static str {
    if flag {
        "✅"
    } else {
        "❌"
    }
}

/// Renders the final message for a run, error or success.
pub fn format_pipeline_response(state: &PipelineState, config: &AgentConfig) -> String {
    match state.error.as_deref().filter(|e| !e.is_empty()) {
        Some(error) => format_error_response(error),
        None => format_success_response(state, config),
    }
}

pub fn format_success_response(state: &PipelineState, config: &AgentConfig) -> String {
    let count = state.processed_data.as_ref().map_or(0, Vec::len);
    let (fields, limit) = match &state.extracted_params {
        Some(params) => (params.fields.join(", "), params.limit),
        None => ("all".to_string(), config.limits.default),
    };
    let sheet_url = if state.sheets_url.is_empty() {
        NOT_AVAILABLE
    } else {
        state.sheets_url.as_str()
    };

    let mut response = format!(
        "✅ Task completed successfully!\n\n\
         📊 **Fetched data:**\n\
         - {} records processed\n\
         - Fields: {}\n\
         - Limit applied: {}\n\n\
         📋 **Google Sheet:**\n\
         {}",
        count, fields, limit, sheet_url
    );

    if let Some(folder_url) = &state.folder_url {
        response.push_str(&format!("\n\n📁 **Folder:**\n{}", folder_url));
    }

    response
}

pub fn format_error_response(message: &str) -> String {
    format!("❌ Error: {}", message)
}

/// Summary for a dry-run validation of a query.
pub fn format_validation_response(params: &ExtractedParams, query: &str) -> String {
    let filters = serde_json::to_string_pretty(&params.filters).unwrap_or_else(|_| "{}".into());
    format!(
        "✅ Query is valid!\n\n\
         📋 **Extracted parameters:**\n\
         - Limit: {}\n\
         - Fields: {}\n\
         - Filters: {}\n\
         - Description: {}\n\n\
         🎯 **Original query:** \"{}\"",
        params.limit,
        params.fields.join(", "),
        filters,
        params.description,
        query
    )
}

pub fn format_status_response(status: &AgentStatus) -> String {
    let overall = if status.ready() {
        "✅ Ready"
    } else {
        "⚠️ Partially configured"
    };
    format!(
        "🤖 **API to Sheets agent status**\n\n\
         🔧 **Configuration:**\n\
         - Model: {}\n\
         - Extractor configured: {}\n\
         - Google Sheets configured: {}\n\n\
         📊 **Capabilities:**\n\
         - Default API: {}\n\
         - Available fields: {}\n\
         - Default limit: {}\n\n\
         🎯 **Overall:** {}",
        status.model,
        check(status.extractor_configured),
        check(status.sheets_configured),
        status.default_api,
        status.valid_fields.join(", "),
        status.default_limit,
        overall
    )
}
