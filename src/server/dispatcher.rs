// Request loop and method routing.
//
// One JSON object per line in, at most one per line out. Notifications get no
// reply; everything else gets exactly one response, including parse failures.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::*;
use super::resources::{read_resource, resource_catalog};
use super::tools::{tool_catalog, GET_AGENT_STATUS, RUN_AGENT, VALIDATE_API_QUERY};
use crate::core::agent::formatting::{
    format_error_response, format_pipeline_response, format_status_response,
    format_validation_response,
};
use crate::core::agent::{AgentPipeline, PipelineState};

const LOG_PREVIEW_CHARS: usize = 100;

pub struct AgentServer {
    pipeline: Arc<AgentPipeline>,
}

impl AgentServer {
    pub fn new(pipeline: Arc<AgentPipeline>) -> Self {
        Self { pipeline }
    }

    /// Serves requests until the reader hits EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!("Agent server started, waiting for requests");
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::debug!("<- {}", preview(line));

            let Some(response) = self.handle_line(line).await else {
                continue;
            };
            let out = serde_json::to_string(&response)?;
            tracing::debug!("-> {}", preview(&out));

            writer.write_all(out.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        tracing::info!("Input closed, agent server shutting down");
        Ok(())
    }

    /// Handles one raw line. `None` means nothing should be written back.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Unparseable request: {}", e);
                return Some(JsonRpcResponse::error(None, PARSE_ERROR, e.to_string()));
            }
        };
        self.handle(request).await
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.method.starts_with("notifications/") {
            tracing::debug!("Notification received: {}", request.method);
            return None;
        }

        let notification = request.is_notification();
        let id = request.id.clone();
        if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
            return Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "Only JSON-RPC 2.0 is supported",
            ));
        }

        let response = match request.method.as_str() {
            "initialize" => to_response(id, &InitializeResult::current()),
            "tools/list" => to_response(
                id,
                &ToolsListResult {
                    tools: tool_catalog(&self.pipeline.config().default_api_url),
                },
            ),
            "tools/call" => {
                let params: ToolCallParams = match serde_json::from_value(request.params) {
                    Ok(params) => params,
                    Err(e) => {
                        return Some(JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()))
                    }
                };
                tracing::info!("Calling tool: {}", params.name);
                match self.call_tool(&params.name, &params.arguments).await {
                    Some(result) => to_response(id, &result),
                    None => JsonRpcResponse::error(
                        id,
                        METHOD_NOT_FOUND,
                        format!("Unknown tool: {}", params.name),
                    ),
                }
            }
            "resources/list" => to_response(
                id,
                &ResourcesListResult {
                    resources: resource_catalog(),
                },
            ),
            "resources/read" => {
                let params: ResourceReadParams = match serde_json::from_value(request.params) {
                    Ok(params) => params,
                    Err(e) => {
                        return Some(JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()))
                    }
                };
                let status = self.pipeline.status();
                match read_resource(&params.uri, self.pipeline.config(), &status) {
                    Some(value) => to_response(id, &ResourceReadResult::json(&params.uri, &value)),
                    None => JsonRpcResponse::error(
                        id,
                        INVALID_PARAMS,
                        format!("Unknown resource: {}", params.uri),
                    ),
                }
            }
            _ => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Unknown method: {}", request.method),
            ),
        };

        // A request without an id is a notification even for known methods.
        if notification {
            return None;
        }
        Some(response)
    }

    /// `None` for a tool name that is not in the catalogue.
    async fn call_tool(&self, name: &str, arguments: &Value) -> Option<ToolCallResult> {
        let result = match name {
            RUN_AGENT => {
                let Some(query) = string_arg(arguments, "query") else {
                    return Some(ToolCallResult::failure(format_error_response(
                        "Please provide a query for the agent",
                    )));
                };
                self.run_agent(query, string_arg(arguments, "api_url")).await
            }
            VALIDATE_API_QUERY => {
                let query = string_arg(arguments, "query").unwrap_or_default();
                match self.pipeline.validate_query(query).await {
                    Ok(params) => ToolCallResult::text(format_validation_response(&params, query)),
                    Err(e) => ToolCallResult::failure(format_error_response(&e.to_string())),
                }
            }
            GET_AGENT_STATUS => {
                ToolCallResult::text(format_status_response(&self.pipeline.status()))
            }
            _ => return None,
        };
        Some(result)
    }

    async fn run_agent(&self, query: &str, api_url: Option<&str>) -> ToolCallResult {
        let mut state = PipelineState::new(self.pipeline.config(), query);
        if let Some(url) = api_url {
            state.api_url = url.to_string();
        }

        let state = self.pipeline.run_state(state).await;
        let text = state
            .final_response()
            .map(str::to_string)
            .unwrap_or_else(|| format_pipeline_response(&state, self.pipeline.config()));

        if state.has_error() {
            ToolCallResult::failure(text)
        } else {
            ToolCallResult::text(text)
        }
    }
}

/// Non-blank string argument.
fn string_arg<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn to_response<T: Serialize>(id: Option<Value>, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Serialization error: {}", e)),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > LOG_PREVIEW_CHARS {
        let head: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
