use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub initialization_options: Option<InitializationOptions>,
}

#[derive(Debug, Deserialize)]
pub struct InitializationOptions {
    pub settings: Option<ServerSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    pub database_url: Option<String>,
}

// MCP specific structures
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
pub struct ServerCapabilities {
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Serialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolsList {
    pub tools: Vec<Tool>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct SchemaArguments {
    pub table_name: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryArguments {
    pub query: String,
    pub database: Option<String>,
    pub max_rows: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct InsertArguments {
    pub table_name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateArguments {
    pub table_name: String,
    pub data: serde_json::Value,
    pub conditions: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct DeleteArguments {
    pub table_name: String,
    pub conditions: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_response_omits_error_field() {
        let response = JsonRpcResponse::success(Some(json!(1)), json!({"ok": true}));
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(
            encoded,
            json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})
        );
    }

    #[test]
    fn error_response_omits_result_field() {
        let response = JsonRpcResponse::error(None, -32700, "Parse error".to_string());
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(
            encoded,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32700, "message": "Parse error"}
            })
        );
    }

    #[test]
    fn parses_request_without_params() {
        let request: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        assert_eq!(request.method, "tools/list");
        assert_eq!(request.id, Some(json!(7)));
        assert!(request.params.is_none());
    }

    #[test]
    fn parses_initialize_settings_as_camel_case() {
        let params: InitializeParams = serde_json::from_value(json!({
            "initializationOptions": {
                "settings": {"databaseUrl": "mysql://u:p@h:3306/d"}
            }
        }))
        .unwrap();
        let url = params
            .initialization_options
            .and_then(|o| o.settings)
            .and_then(|s| s.database_url);
        assert_eq!(url.as_deref(), Some("mysql://u:p@h:3306/d"));
    }

    #[test]
    fn query_arguments_accept_optional_fields() {
        let args: QueryArguments =
            serde_json::from_value(json!({"query": "SELECT 1"})).unwrap();
        assert!(args.database.is_none());
        assert!(args.max_rows.is_none());

        let args: QueryArguments = serde_json::from_value(
            json!({"query": "SELECT 1", "database": "analytics", "max_rows": 10}),
        )
        .unwrap();
        assert_eq!(args.database.as_deref(), Some("analytics"));
        assert_eq!(args.max_rows, Some(10));
    }
}
