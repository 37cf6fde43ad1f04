//! MCP message vocabulary spoken by the gateway

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// MCP protocol version the gateway negotiates
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names the gateway recognizes
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}

// === Initialize ===

/// Parameters for the initialize method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol version
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,

    /// Client capabilities
    #[serde(default)]
    pub capabilities: ClientCapabilities,

    /// Client information
    #[serde(rename = "clientInfo", skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Result of the initialize method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Server capabilities
    pub capabilities: ServerCapabilities,

    /// Server information
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Capabilities reported by a client on initialize
///
/// The gateway records these per session but does not interpret them; the
/// open map keeps forward compatibility with newer clients.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(flatten)]
    pub capabilities: HashMap<String, Value>,
}

/// Capabilities advertised by the gateway
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

/// Tool capability flags
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether the server emits tools/list_changed notifications
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Client information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,

    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

/// Server information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,

    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

// === Tools ===

/// Tool descriptor as advertised to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name
    pub name: String,

    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Input schema for the tool
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,

    /// Additional tool metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

/// Result of tools/list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// List of available tools
    pub tools: Vec<Tool>,

    /// Next cursor for pagination
    #[serde(skip_serializing_if = "Option::is_none", rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Parameters for tools/call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallParams {
    /// Tool name to call
    pub name: String,

    /// Tool arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Result of tools/call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallResult {
    /// Tool execution content
    pub content: Vec<Value>,

    /// Whether the tool call is an error
    #[serde(default, rename = "isError")]
    pub is_error: bool,

    /// Additional metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_params_tolerates_minimal_body() {
        let params: InitializeParams = serde_json::from_value(json!({})).unwrap();
        assert!(params.protocol_version.is_none());
        assert!(params.client_info.is_none());
    }

    #[test]
    fn test_initialize_result_field_names() {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                other: HashMap::new(),
            },
            server_info: ServerInfo {
                name: "manifold".to_string(),
                version: "0.3.2".to_string(),
                metadata: HashMap::new(),
            },
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(value["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(value["serverInfo"]["name"], "manifold");
    }

    #[test]
    fn test_tool_preserves_unknown_members() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "ping",
            "inputSchema": {"type": "object"},
            "annotations": {"readOnlyHint": true}
        }))
        .unwrap();

        assert_eq!(tool.name, "ping");
        assert!(tool.description.is_none());
        assert!(tool.metadata.contains_key("annotations"));

        let back = serde_json::to_value(&tool).unwrap();
        assert_eq!(back["annotations"]["readOnlyHint"], true);
    }

    #[test]
    fn test_tools_call_params() {
        let params: ToolsCallParams = serde_json::from_value(json!({
            "name": "echo__ping",
            "arguments": {"msg": "hi"}
        }))
        .unwrap();
        assert_eq!(params.name, "echo__ping");
        assert_eq!(params.arguments, Some(json!({"msg": "hi"})));
    }
}
