use crate::unity_connection_provider::UnityConnectionProvider;
use crate::unity_messages::{BridgeError, PING_COMMAND};
use crate::unity_transport::BridgeTransport;
use log::warn;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    schemars, tool, tool_handler, tool_router,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Largest number of calls accepted by `batch_call`
pub const MAX_BATCH_CALLS: usize = 50;

/// A batch runs many Unity functions, so it is resent at most once
const BATCH_CALL_RETRIES: u32 = 1;

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SingleCallRequest {
    #[schemars(
        description = "Name of the Unity function to call, e.g. `hierarchy_create`, `edit_gameobject` or `gameplay`."
    )]
    pub func: String,
    #[schemars(
        description = "Arguments passed to the Unity function as an object. The keys must follow the target function's definition."
    )]
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BatchCallRequest {
    #[schemars(
        description = "Calls to run in order (1 to 50). Each item is an object with a `func` string and an `args` object, e.g. `{\"func\": \"hierarchy_create\", \"args\": {\"name\": \"Enemy\"}}`."
    )]
    pub funcs: Vec<Value>,
}

/// MCP server that forwards function calls to the Unity Editor bridge
#[derive(Clone)]
pub struct UnityBridgeMcpServer {
    provider: Arc<UnityConnectionProvider<BridgeTransport>>,
    tool_router: ToolRouter<UnityBridgeMcpServer>,
}

#[tool_router]
impl UnityBridgeMcpServer {
    pub fn new(provider: Arc<UnityConnectionProvider<BridgeTransport>>) -> Self {
        Self {
            provider,
            tool_router: Self::tool_router(),
        }
    }

    pub fn provider(&self) -> &Arc<UnityConnectionProvider<BridgeTransport>> {
        &self.provider
    }

    /// Message for a failed command, including recent port failures
    async fn failure_message(&self, command_type: &str, error: &BridgeError) -> String {
        let detail = self.provider.describe_failure(command_type, error).await;
        if error.is_connection_class() {
            format!("Unity connection error: {}", detail)
        } else {
            format!("Function call failed: {}", detail)
        }
    }

    async fn run_single_call(&self, func: &str, args: Map<String, Value>) -> Value {
        if func.trim().is_empty() {
            return json!({
                "success": false,
                "error": "Function name is invalid or empty",
                "result": null
            });
        }

        let params = json!({ "func": func, "args": Value::Object(args) });
        let retries = self.provider.config().max_retries;
        match self
            .provider
            .send_command_with_retry("single_call", params, retries)
            .await
        {
            Ok(result) => single_call_response(result),
            Err(e) => {
                warn!("single_call '{}' failed: {}", func, e);
                json!({
                    "success": false,
                    "error": self.failure_message("single_call", &e).await,
                    "result": null
                })
            }
        }
    }

    async fn run_batch_call(&self, funcs: Vec<Value>) -> Value {
        if let Err(message) = validate_batch(&funcs) {
            return batch_failure(funcs.len(), message);
        }

        let total_calls = funcs.len();
        match self
            .provider
            .send_command_with_retry("batch_call", Value::Array(funcs), BATCH_CALL_RETRIES)
            .await
        {
            Ok(result) => batch_call_response(result, total_calls),
            Err(e) => {
                warn!("batch_call of {} functions failed: {}", total_calls, e);
                let message = self.failure_message("batch_call", &e).await;
                batch_failure(total_calls, format!("Batch call forwarding failed: {}", message))
            }
        }
    }

    async fn run_ping(&self) -> Value {
        match self.provider.send_command(PING_COMMAND, Value::Null).await {
            Ok(result) => {
                let (port, _) = self.provider.status().await;
                json!({ "success": true, "result": result, "port": port })
            }
            Err(e) => json!({
                "success": false,
                "error": self.failure_message(PING_COMMAND, &e).await,
                "result": null
            }),
        }
    }

    /// Call a single Unity function
    #[tool(
        description = "Call one Unity Editor function through the bridge. Every Unity function other than single_call and batch_call must be invoked through this tool or batch_call, with all of its arguments in `args`."
    )]
    async fn single_call(
        &self,
        Parameters(SingleCallRequest { func, args }): Parameters<SingleCallRequest>,
    ) -> Result<CallToolResult, McpError> {
        let response = self.run_single_call(&func, args).await;
        Ok(CallToolResult::success(vec![Content::text(
            response.to_string(),
        )]))
    }

    /// Call several Unity functions in order
    #[tool(
        description = "Call up to 50 Unity Editor functions in order and collect every result. Useful for multi-step operations such as create, configure and add components, or play, screenshot and stop."
    )]
    async fn batch_call(
        &self,
        Parameters(BatchCallRequest { funcs }): Parameters<BatchCallRequest>,
    ) -> Result<CallToolResult, McpError> {
        let response = self.run_batch_call(funcs).await;
        Ok(CallToolResult::success(vec![Content::text(
            response.to_string(),
        )]))
    }

    /// Check that the Unity Editor bridge answers
    #[tool(description = "Ping the Unity Editor bridge and report the port it answered on.")]
    async fn unity_ping(&self) -> Result<CallToolResult, McpError> {
        let response = self.run_ping().await;
        Ok(CallToolResult::success(vec![Content::text(
            response.to_string(),
        )]))
    }
}

/// Object results are returned as they are, anything else gets the standard wrapper
fn single_call_response(result: Value) -> Value {
    if result.is_object() {
        result
    } else {
        json!({ "success": true, "result": result, "error": null })
    }
}

/// Checks the shape of every call before anything is sent to Unity
fn validate_batch(funcs: &[Value]) -> Result<(), String> {
    if funcs.is_empty() || funcs.len() > MAX_BATCH_CALLS {
        return Err(format!(
            "funcs must contain between 1 and {} calls, got {}",
            MAX_BATCH_CALLS,
            funcs.len()
        ));
    }

    for (i, call) in funcs.iter().enumerate() {
        let Some(call) = call.as_object() else {
            return Err(format!("Call {} must be an object", i + 1));
        };
        match call.get("func").and_then(Value::as_str) {
            Some(func) if !func.trim().is_empty() => {}
            _ => return Err(format!("Call {} has an invalid or empty func field", i + 1)),
        }
        if !call.get("args").is_some_and(Value::is_object) {
            return Err(format!("Call {} must have an args object", i + 1));
        }
    }
    Ok(())
}

/// Unity answers a batch with the full summary under `data`; other shapes are wrapped
fn batch_call_response(result: Value, total_calls: usize) -> Value {
    match result {
        Value::Object(mut object) if object.contains_key("data") => {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => json!({
            "success": true,
            "results": [other],
            "errors": [null],
            "total_calls": total_calls,
            "successful_calls": 1,
            "failed_calls": 0
        }),
    }
}

fn batch_failure(total_calls: usize, message: String) -> Value {
    json!({
        "success": false,
        "results": [],
        "errors": [message],
        "total_calls": total_calls,
        "successful_calls": 0,
        "failed_calls": 1
    })
}

#[tool_handler]
impl ServerHandler for UnityBridgeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Unity Editor bridge. Use single_call or batch_call to invoke Unity functions; unity_ping checks the connection."
                    .into(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FAILING_COMMAND, FakeUnityServer, fast_config, init_test_logging};
    use crate::bridge_config::BridgeConfig;
    use crate::unity_transport::FramedSocketTransport;

    fn server_for(port: u16) -> UnityBridgeMcpServer {
        server_with(fast_config(port, port, false))
    }

    fn server_with(config: BridgeConfig) -> UnityBridgeMcpServer {
        init_test_logging();
        let transport = BridgeTransport::Socket(FramedSocketTransport::new(&config));
        UnityBridgeMcpServer::new(Arc::new(UnityConnectionProvider::new(transport, config)))
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_single_call_response_shapes() {
        let object = json!({"success": true, "data": {"name": "Cube"}});
        assert_eq!(single_call_response(object.clone()), object);
        assert_eq!(
            single_call_response(json!(42)),
            json!({"success": true, "result": 42, "error": null})
        );
    }

    #[test]
    fn test_batch_validation() {
        let good = vec![json!({"func": "hierarchy_create", "args": {"name": "Enemy"}})];
        assert!(validate_batch(&good).is_ok());

        assert!(validate_batch(&[]).is_err());
        let too_many = vec![json!({"func": "f", "args": {}}); MAX_BATCH_CALLS + 1];
        assert!(validate_batch(&too_many).is_err());

        let missing_args = vec![good[0].clone(), json!({"func": "edit_gameobject"})];
        assert_eq!(
            validate_batch(&missing_args).unwrap_err(),
            "Call 2 must have an args object"
        );
        assert!(validate_batch(&[json!({"func": "", "args": {}})]).is_err());
        assert!(validate_batch(&[json!("hierarchy_create")]).is_err());
    }

    #[test]
    fn test_batch_response_unwraps_data() {
        let summary = json!({"success": true, "results": [1, 2], "total_calls": 2});
        let wrapped = json!({"data": summary.clone()});
        assert_eq!(batch_call_response(wrapped, 2), summary);

        let other = batch_call_response(json!("done"), 3);
        assert_eq!(other["results"], json!(["done"]));
        assert_eq!(other["total_calls"], 3);
        assert_eq!(other["successful_calls"], 1);
    }

    #[tokio::test]
    async fn test_single_call_forwards_to_unity() {
        let unity = FakeUnityServer::start().await;
        let server = server_for(unity.port());

        let response = server
            .run_single_call("get_state", args(json!({"verbose": true})))
            .await;
        assert_eq!(
            response,
            json!({"type": "single_call", "echo": {"func": "get_state", "args": {"verbose": true}}})
        );

        let response = server.run_single_call("  ", Map::new()).await;
        assert_eq!(response["success"], false);

        unity.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_call_forwards_to_unity() {
        let unity = FakeUnityServer::start().await;
        let server = server_for(unity.port());

        let funcs = vec![
            json!({"func": "hierarchy_create", "args": {"name": "Enemy"}}),
            json!({"func": "edit_gameobject", "args": {"path": "Enemy"}}),
        ];
        let response = server.run_batch_call(funcs).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["total_calls"], 2);
        assert_eq!(response["results"][0]["type"], "batch_call");

        let response = server.run_batch_call(vec![json!({"func": "x"})]).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["failed_calls"], 1);

        unity.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_error_is_reported_as_call_failure() {
        let unity = FakeUnityServer::start().await;
        let server = server_for(unity.port());

        let result = server
            .provider()
            .send_command_with_retry(FAILING_COMMAND, json!({}), 0)
            .await;
        let error = result.unwrap_err();
        let message = server.failure_message(FAILING_COMMAND, &error).await;
        assert!(message.starts_with("Function call failed: Command 'explode' failed"));
        assert!(message.contains("Function not found"));

        unity.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_call_retries_follow_config() {
        let unity = FakeUnityServer::start().await;
        let port = unity.port();

        let server = server_for(port);
        let response = server.run_single_call(FAILING_COMMAND, Map::new()).await;
        assert_eq!(response["success"], false);
        assert_eq!(unity.command_count(), 3);

        let config = BridgeConfig {
            max_retries: 0,
            ..fast_config(port, port, false)
        };
        let server = server_with(config);
        let response = server.run_single_call(FAILING_COMMAND, Map::new()).await;
        assert_eq!(response["success"], false);
        assert_eq!(unity.command_count(), 4);

        unity.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_unity_is_reported() {
        let unity = FakeUnityServer::start().await;
        let port = unity.port();
        unity.shutdown().await;
        let server = server_for(port);

        let response = server.run_single_call("get_state", Map::new()).await;
        assert_eq!(response["success"], false);
        let error = response["error"].as_str().unwrap();
        assert!(error.starts_with("Unity connection error:"));
        assert!(error.contains(&port.to_string()));

        let response = server.run_ping().await;
        assert_eq!(response["success"], false);
    }

    #[tokio::test]
    async fn test_ping_reports_port() {
        let unity = FakeUnityServer::start().await;
        let server = server_for(unity.port());

        let response = server.run_ping().await;
        assert_eq!(response["success"], true);
        assert_eq!(response["result"], json!({"message": "pong"}));
        assert_eq!(response["port"], unity.port());

        unity.shutdown().await;
    }
}
