//! Wire types shared by every Manifold crate
//!
//! This crate defines the JSON-RPC 2.0 message model, the MCP message
//! vocabulary the gateway speaks (initialize, tools, notifications), and the
//! gateway error contract with its stable numeric codes and HTTP mapping.

pub mod error;
pub mod jsonrpc;
pub mod messages;

pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use jsonrpc::{JsonRpcError, JsonRpcFrame, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use messages::{
    ClientCapabilities, InitializeParams, InitializeResult, ServerCapabilities, ServerInfo, Tool,
    ToolsCallParams, ToolsCallResult, ToolsCapability, ToolsListResult, PROTOCOL_VERSION,
};
