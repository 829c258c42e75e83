use bridge_protocol::{Request, Response, codes};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::registry::ToolRegistry;

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "xschem-mcp-bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesList,
    PromptsList,
    Unknown,
}

impl Method {
    pub fn parse(name: &str) -> Self {
        match name {
            "initialize" => Method::Initialize,
            "ping" => Method::Ping,
            "tools/list" => Method::ToolsList,
            "tools/call" => Method::ToolsCall,
            "resources/list" => Method::ResourcesList,
            "prompts/list" => Method::PromptsList,
            _ => Method::Unknown,
        }
    }
}

/// Fire-and-forget methods that are dropped without a reply when they carry
/// no id.
pub fn is_silent_notification(method: &str) -> bool {
    method.starts_with("notifications/") || method == "$/cancelRequest"
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown method: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(&'static str),
}

impl DispatchError {
    pub fn code(&self) -> i64 {
        match self {
            DispatchError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            DispatchError::InvalidParams(_) => codes::INVALID_PARAMS,
        }
    }
}

pub struct Dispatcher {
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub async fn handle_message(&self, message: Value) -> Option<Response> {
        let id = message.get("id").filter(|v| !v.is_null()).cloned();
        match serde_json::from_value::<Request>(message) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, id = ?id, "invalid request");
                id.map(|id| {
                    Response::err(Some(id), codes::INVALID_REQUEST, format!("invalid request: {e}"))
                })
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Option<Response> {
        let method = request.method.as_str();
        if request.is_notification() && is_silent_notification(method) {
            debug!(method, "notification");
            return None;
        }
        info!(method, id = ?request.id, "request");

        let outcome = self.dispatch(&request).await;
        let Some(id) = request.id.clone() else {
            if let Err(e) = outcome {
                warn!(method, error = %e, "notification failed");
            }
            return None;
        };

        let response = match outcome {
            Ok(result) => Response::ok(Some(id), result),
            Err(e) => {
                warn!(method, error = %e, "request failed");
                Response::err(Some(id), e.code(), e.to_string())
            }
        };
        info!(method, id = ?response.id, is_error = response.is_error(), "response");
        Some(response)
    }

    async fn dispatch(&self, request: &Request) -> Result<Value, DispatchError> {
        let params = request.params_object();
        match Method::parse(&request.method) {
            Method::Initialize => Ok(initialize_result(&params)),
            Method::Ping => Ok(json!({})),
            Method::ResourcesList => Ok(json!({ "resources": [] })),
            Method::PromptsList => Ok(json!({ "prompts": [] })),
            Method::ToolsList => Ok(self.registry.list_tools()),
            Method::ToolsCall => {
                let (name, arguments) = call_params(&params)?;
                Ok(self.registry.invoke(&name, &arguments).await)
            }
            Method::Unknown => Err(DispatchError::MethodNotFound(request.method.clone())),
        }
    }
}

fn initialize_result(params: &Map<String, Value>) -> Value {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "subscribe": false, "listChanged": false },
            "prompts": { "listChanged": false }
        },
        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
    })
}

fn call_params(
    params: &Map<String, Value>,
) -> Result<(String, Map<String, Value>), DispatchError> {
    let name = match params.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(DispatchError::InvalidParams("tools/call `name` must be a string")),
        None => return Err(DispatchError::InvalidParams("tools/call requires `name`")),
    };
    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments.clone(),
        Some(_) => {
            return Err(DispatchError::InvalidParams(
                "tools/call `arguments` must be an object",
            ));
        }
    };
    Ok((name, arguments))
}
