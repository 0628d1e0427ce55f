//! Wire types for the stdio JSON-RPC surface: the envelope, the tool
//! listing, and the `{content:[{type:"text",...}]}` result shape every tool
//! call produces.

mod jsonrpc;
mod tools;

pub use jsonrpc::JSONRPC_VERSION;
pub use jsonrpc::JSONRPCError;
pub use jsonrpc::JSONRPCErrorError;
pub use jsonrpc::JSONRPCMessage;
pub use jsonrpc::JSONRPCNotification;
pub use jsonrpc::JSONRPCRequest;
pub use jsonrpc::JSONRPCResponse;
pub use jsonrpc::RequestId;
pub use tools::CallToolRequestParams;
pub use tools::CallToolResult;
pub use tools::CallToolResultContent;
pub use tools::InitializeResult;
pub use tools::ListToolsResult;
pub use tools::ServerCapabilities;
pub use tools::ServerCapabilitiesTools;
pub use tools::ServerInfo;
pub use tools::TextContent;
pub use tools::Tool;

/// JSON-RPC error codes used by the server. The first two are the standard
/// codes; the rest partition the core's error taxonomy so clients can react
/// without parsing messages.
pub mod error_codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const AUTHORIZATION: i64 = -32001;
    pub const EXTERNAL_CHANGE: i64 = -32002;
    pub const CONTENT_EXPECTATION: i64 = -32003;
    pub const SANDBOX: i64 = -32004;
    pub const RESOURCE: i64 = -32005;
    pub const TRANSACTIONAL: i64 = -32006;
}
