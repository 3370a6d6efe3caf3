// SPDX-License-Identifier: Apache-2.0

//! Remote tool client
//!
//! Calls tools over HTTP using JSON-RPC 2.0 `tools/call` requests, the
//! transport MCP servers expose. Tool payloads may arrive wrapped in an MCP
//! content envelope; [`unwrap_tool_result`] peels that off so the executor
//! only ever validates the tool's own data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, instrument};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::ToolInvoker;
use crate::observability::Sensitive;

/// How a tool endpoint authenticates requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolAuth {
    Bearer { token: Sensitive<String> },
    ApiKey { key: Sensitive<String> },
}

pub struct HttpToolClient {
    client: Client,
    endpoint: url::Url,
    auth: Option<ToolAuth>,
    next_id: AtomicU64,
}

impl HttpToolClient {
    pub fn new(endpoint: &str, auth: Option<ToolAuth>, timeout: Duration) -> EngineResult<Self> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| EngineError::config(format!("Invalid tool endpoint '{endpoint}': {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(EngineError::config(format!(
                "Tool endpoint must be http(s): {endpoint}"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            auth,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl ToolInvoker for HttpToolClient {
    #[instrument(skip(self, arguments), fields(endpoint = %self.endpoint))]
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, JsonValue>,
    ) -> EngineResult<JsonValue> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": tool_name, "arguments": arguments },
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        match &self.auth {
            Some(ToolAuth::Bearer { token }) => request = request.bearer_auth(token.expose()),
            Some(ToolAuth::ApiKey { key }) => request = request.header("X-API-Key", key.expose()),
            None => {}
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::execution_error(format!("Tool call timed out: {e}"))
            } else {
                EngineError::connection_failed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::execution_error(format!(
                "HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let payload: JsonValue = response
            .json()
            .await
            .map_err(|e| EngineError::execution_error(format!("Invalid JSON-RPC response: {e}")))?;
        debug!(tool = tool_name, "Tool call returned");

        unwrap_rpc_response(payload).map(unwrap_tool_result)
    }
}

/// Extracts `result` from a JSON-RPC response, surfacing RPC and tool errors.
pub fn unwrap_rpc_response(payload: JsonValue) -> EngineResult<JsonValue> {
    let JsonValue::Object(mut envelope) = payload else {
        return Err(EngineError::execution_error(
            "JSON-RPC response is not an object",
        ));
    };

    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(EngineError::execution_error(message));
    }

    let result = envelope
        .remove("result")
        .ok_or_else(|| EngineError::execution_error("JSON-RPC response has no result"))?;

    if result.get("isError").and_then(JsonValue::as_bool) == Some(true) {
        let message = first_text(&result).unwrap_or("tool reported an error");
        return Err(EngineError::execution_error(message.to_string()));
    }
    Ok(result)
}

/// Peels an MCP content envelope off a tool result.
///
/// `structuredContent` wins; otherwise the first text block is parsed as JSON.
/// Anything else is returned unchanged for the tabular validator to judge.
pub fn unwrap_tool_result(result: JsonValue) -> JsonValue {
    let JsonValue::Object(mut obj) = result else {
        return result;
    };

    if let Some(structured) = obj.remove("structuredContent") {
        // Single-key wrappers like {"rows": [...]} are common for array results.
        return match structured {
            JsonValue::Object(inner) if inner.len() == 1 && inner.values().all(JsonValue::is_array) => {
                inner.into_iter().next().map(|(_, rows)| rows).unwrap_or(JsonValue::Null)
            }
            other => other,
        };
    }

    let parsed = first_text(&JsonValue::Object(obj.clone()))
        .and_then(|text| serde_json::from_str::<JsonValue>(text).ok());
    match parsed {
        Some(value) => value,
        None => JsonValue::Object(obj),
    }
}

fn first_text(result: &JsonValue) -> Option<&str> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find(|block| block.get("type").and_then(JsonValue::as_str) == Some("text"))?
        .get("text")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_become_execution_errors() {
        let err = unwrap_rpc_response(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Method not found"));
    }

    #[test]
    fn tool_errors_become_execution_errors() {
        let err = unwrap_rpc_response(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"isError": true, "content": [{"type": "text", "text": "quota exceeded"}]}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn text_content_is_parsed_as_json() {
        let result = json!({
            "content": [{"type": "text", "text": "[{\"id\": 1}, {\"id\": 2}]"}]
        });
        assert_eq!(unwrap_tool_result(result), json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn structured_content_wins() {
        let result = json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"rows": [{"a": true}]}
        });
        assert_eq!(unwrap_tool_result(result), json!([{"a": true}]));
    }

    #[test]
    fn bare_arrays_pass_through() {
        assert_eq!(unwrap_tool_result(json!([{"x": 1}])), json!([{"x": 1}]));
    }

    #[test]
    fn rejects_non_http_endpoints() {
        let err = HttpToolClient::new("ftp://tools.local", None, Duration::from_secs(1)).err();
        assert!(matches!(err, Some(EngineError::Config { .. })));
    }

    #[test]
    fn auth_deserializes_and_stays_redacted() {
        let auth: ToolAuth =
            serde_json::from_value(json!({"type": "bearer", "token": "s3cret"})).unwrap();
        assert!(!format!("{auth:?}").contains("s3cret"));
    }
}
