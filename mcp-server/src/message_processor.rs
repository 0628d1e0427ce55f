use std::sync::Arc;

use scribe_core::TaskManager;
use scribe_protocol::CallToolRequestParams;
use scribe_protocol::InitializeResult;
use scribe_protocol::JSONRPC_VERSION;
use scribe_protocol::JSONRPCError;
use scribe_protocol::JSONRPCErrorError;
use scribe_protocol::JSONRPCMessage;
use scribe_protocol::JSONRPCNotification;
use scribe_protocol::JSONRPCRequest;
use scribe_protocol::JSONRPCResponse;
use scribe_protocol::ListToolsResult;
use scribe_protocol::RequestId;
use scribe_protocol::ServerCapabilities;
use scribe_protocol::ServerCapabilitiesTools;
use scribe_protocol::ServerInfo;
use scribe_protocol::error_codes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::tool_config::all_tools;
use crate::tool_runner::run_tool;

pub(crate) struct MessageProcessor {
    outgoing: mpsc::Sender<JSONRPCMessage>,
    task_manager: Arc<TaskManager>,
    initialized: bool,
}

impl MessageProcessor {
    /// Create a new `MessageProcessor`, retaining a handle to the outgoing
    /// `Sender` so handlers can enqueue messages to be written to stdout.
    pub(crate) fn new(
        outgoing: mpsc::Sender<JSONRPCMessage>,
        task_manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            outgoing,
            task_manager,
            initialized: false,
        }
    }

    pub(crate) async fn process_request(&mut self, request: JSONRPCRequest) {
        let request_id = request.id.clone();
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request_id).await,
            "ping" => {
                self.send_response(request_id, serde_json::json!({})).await;
            }
            "tools/list" => self.handle_list_tools(request_id).await,
            "tools/call" => self.handle_call_tool(request_id, request.params).await,
            other => {
                tracing::warn!("unknown method: {other}");
                self.send_error(
                    request_id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not supported: {other}"),
                )
                .await;
            }
        }
    }

    pub(crate) fn process_notification(&mut self, notification: JSONRPCNotification) {
        tracing::debug!("notification: {}", notification.method);
    }

    pub(crate) fn process_response(&mut self, response: JSONRPCResponse) {
        tracing::debug!("unexpected response: {response:?}");
    }

    pub(crate) fn process_error(&mut self, error: JSONRPCError) {
        tracing::error!("received error message: {error:?}");
    }

    async fn handle_initialize(&mut self, id: RequestId) {
        if self.initialized {
            self.send_error(
                id,
                error_codes::INVALID_PARAMS,
                "initialize called more than once".to_string(),
            )
            .await;
            return;
        }
        self.initialized = true;
        let result = InitializeResult {
            protocol_version: "2025-03-26".to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {}),
            },
            server_info: ServerInfo {
                name: "scribe".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        self.send_serialized(id, result).await;
    }

    async fn handle_list_tools(&self, id: RequestId) {
        let result = ListToolsResult { tools: all_tools() };
        self.send_serialized(id, result).await;
    }

    async fn handle_call_tool(&self, id: RequestId, params: Option<serde_json::Value>) {
        let params = match params
            .ok_or_else(|| "missing params".to_string())
            .and_then(|p| {
                serde_json::from_value::<CallToolRequestParams>(p).map_err(|e| e.to_string())
            }) {
            Ok(params) => params,
            Err(e) => {
                self.send_error(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("invalid tools/call params: {e}"),
                )
                .await;
                return;
            }
        };

        // Tool execution is synchronous filesystem work; hand it to the
        // blocking pool so the protocol loop stays responsive.
        let task_manager = Arc::clone(&self.task_manager);
        let name = params.name.clone();
        let arguments = params.arguments.unwrap_or(serde_json::Value::Null);
        let outcome = tokio::task::spawn_blocking(move || {
            run_tool(&task_manager, &name, arguments)
        })
        .await;

        match outcome {
            Ok(Ok(result)) => self.send_serialized(id, result).await,
            Ok(Err(envelope)) => {
                self.send_error_with_data(id, envelope.code, envelope.message, envelope.data)
                    .await
            }
            Err(e) => {
                self.send_error(
                    id,
                    error_codes::INTERNAL_ERROR,
                    format!("tool task failed: {e}"),
                )
                .await
            }
        }
    }

    async fn send_serialized(&self, id: RequestId, result: impl Serialize) {
        match serde_json::to_value(result) {
            Ok(result) => self.send_response(id, result).await,
            Err(e) => {
                self.send_error(
                    id,
                    error_codes::INTERNAL_ERROR,
                    format!("failed to serialize result: {e}"),
                )
                .await
            }
        }
    }

    async fn send_response(&self, id: RequestId, result: serde_json::Value) {
        let response = JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        });
        if let Err(e) = self.outgoing.send(response).await {
            tracing::error!("failed to enqueue response: {e}");
        }
    }

    async fn send_error(&self, id: RequestId, code: i64, message: String) {
        self.send_error_with_data(id, code, message, None).await;
    }

    async fn send_error_with_data(
        &self,
        id: RequestId,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    ) {
        let error = JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JSONRPCErrorError {
                code,
                message,
                data,
            },
        });
        if let Err(e) = self.outgoing.send(error).await {
            tracing::error!("failed to enqueue error: {e}");
        }
    }
}
