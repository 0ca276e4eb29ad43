// Tool catalogue advertised through `tools/list`.

use serde_json::json;

use super::protocol::Tool;

pub const RUN_AGENT: &str = "run_agent";
pub const VALIDATE_API_QUERY: &str = "validate_api_query";
pub const GET_AGENT_STATUS: &str = "get_agent_status";

pub fn tool_catalog(default_api_url: &str) -> Vec<Tool> {
    vec![
        Tool {
            name: RUN_AGENT,
            description: "Fetch records from a JSON API according to a natural-language \
                          request and export them to a new Google Sheet",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to fetch, e.g. 'get 5 posts with title and id'"
                    },
                    "api_url": {
                        "type": "string",
                        "description": "Endpoint to query (optional)",
                        "default": default_api_url
                    }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: VALIDATE_API_QUERY,
            description: "Parse and validate a request without fetching or exporting anything",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Request to validate"
                    }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: GET_AGENT_STATUS,
            description: "Report which integrations are configured and what the agent can do",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
    ]
}
