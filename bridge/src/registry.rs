use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::ToolError;
use crate::policy::PolicyGate;
use crate::remote::RemoteClient;
use crate::supervisor::{ProcessSupervisor, StartRequest, StartStatus};
use crate::tools::ToolKind;

const DEFAULT_COMMAND: &str = "xschem";
const DEFAULT_STARTUP_TIMEOUT_SECS: f64 = 8.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub payload: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn into_result(self) -> Value {
        let text = self.payload.to_string();
        let mut result = json!({
            "content": [{ "type": "text", "text": text }],
            "isError": self.is_error
        });
        if self.payload.is_object() {
            result["structuredContent"] = self.payload;
        }
        result
    }
}

pub fn tool_error_result(err: &ToolError) -> Value {
    let message = err.to_string();
    json!({
        "content": [{ "type": "text", "text": message }],
        "structuredContent": { "error": { "kind": err.kind(), "message": message } },
        "isError": true
    })
}

#[derive(Deserialize)]
struct StartProcessArgs {
    tcp_port: u16,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    extra_args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    startup_timeout_seconds: Option<f64>,
}

#[derive(Deserialize)]
struct StopProcessArgs {
    tcp_port: u16,
    #[serde(default)]
    force: Option<bool>,
}

#[derive(Deserialize)]
struct ProcessStatusArgs {
    #[serde(default)]
    tcp_port: Option<u16>,
}

fn parse_args<T: DeserializeOwned>(args: &Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn require(args: &Map<String, Value>, key: &'static str) -> Result<(), ToolError> {
    match args.get(key) {
        Some(v) if !v.is_null() => Ok(()),
        _ => Err(ToolError::MissingArgument(key)),
    }
}

pub struct ToolRegistry {
    catalog: Arc<Catalog>,
    gate: PolicyGate,
    remote: Arc<RemoteClient>,
    supervisor: ProcessSupervisor,
}

impl ToolRegistry {
    pub fn new(
        catalog: Arc<Catalog>,
        remote: Arc<RemoteClient>,
        supervisor: ProcessSupervisor,
        require_confirmation: bool,
    ) -> Self {
        Self {
            gate: PolicyGate::new(catalog.clone(), require_confirmation),
            catalog,
            remote,
            supervisor,
        }
    }

    pub fn list_tools(&self) -> Value {
        let tools: Vec<_> = self.catalog.descriptors().collect();
        json!({ "tools": tools })
    }

    pub async fn invoke(&self, name: &str, args: &Map<String, Value>) -> Value {
        match self.call_tool(name, args).await {
            Ok(outcome) => outcome.into_result(),
            Err(e) => {
                warn!(tool = name, kind = e.kind(), error = %e, "tool call failed");
                tool_error_result(&e)
            }
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolOutcome, ToolError> {
        let entry = self.gate.authorize(name, args)?;

        let Some(action) = entry.policy.remote_action.as_deref() else {
            return self.call_local(entry.kind, args).await;
        };

        let wrapper_args = entry.kind.remote_args(args)?;
        let response = self.remote.run_wrapper(action, &wrapper_args).await?;
        let status = response.get("status").and_then(Value::as_str).unwrap_or("");
        let code = match response.get("code") {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        };
        let is_error = status != "ok";
        info!(tool = name, is_error, status, code = %code, "tool call complete");
        Ok(ToolOutcome {
            payload: response,
            is_error,
        })
    }

    async fn call_local(
        &self,
        kind: ToolKind,
        args: &Map<String, Value>,
    ) -> Result<ToolOutcome, ToolError> {
        let payload = match kind {
            ToolKind::StartProcess => {
                require(args, "tcp_port")?;
                let parsed: StartProcessArgs = parse_args(args)?;
                let secs = parsed
                    .startup_timeout_seconds
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS);
                let startup_timeout = Duration::try_from_secs_f64(secs)
                    .map_err(|e| ToolError::InvalidArguments(format!("startup_timeout_seconds: {e}")))?;
                let report = self
                    .supervisor
                    .start(StartRequest {
                        tcp_port: parsed.tcp_port,
                        command: parsed.command.unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
                        extra_args: parsed.extra_args,
                        cwd: parsed.cwd.filter(|c| !c.is_empty()).map(PathBuf::from),
                        display: parsed.display,
                        startup_timeout,
                    })
                    .await?;
                if matches!(report.status, StartStatus::Started | StartStatus::AlreadyRunning) {
                    self.remote.set_port(report.tcp_port).await;
                }
                json!(report)
            }
            ToolKind::StopProcess => {
                require(args, "tcp_port")?;
                let parsed: StopProcessArgs = parse_args(args)?;
                let report = self
                    .supervisor
                    .stop(parsed.tcp_port, parsed.force.unwrap_or(false))
                    .await?;
                json!(report)
            }
            ToolKind::ProcessStatus => {
                let parsed: ProcessStatusArgs = parse_args(args)?;
                let report = self.supervisor.status(parsed.tcp_port).await;
                json!(report)
            }
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "no local handler for {}",
                    other.name()
                )));
            }
        };
        info!(tool = kind.name(), "local tool call complete");
        Ok(ToolOutcome {
            payload,
            is_error: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyError;
    use crate::testing::{args, closed_port, fake_remote, remote_client};
    use tokio::net::TcpListener;

    fn registry(remote_port: u16) -> (ToolRegistry, Arc<RemoteClient>) {
        let catalog = Arc::new(Catalog::load_embedded().unwrap());
        let remote = Arc::new(remote_client(remote_port));
        let registry = ToolRegistry::new(
            catalog,
            remote.clone(),
            ProcessSupervisor::new("127.0.0.1"),
            true,
        );
        (registry, remote)
    }

    #[test]
    fn lists_every_catalog_tool() {
        let (registry, _) = registry(closed_port());
        let listed = registry.list_tools();
        let tools = listed["tools"].as_array().unwrap();
        assert_eq!(tools.len(), ToolKind::ALL.len());
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn policy_failures_send_nothing() {
        let (port, seen) = fake_remote(vec![r#"{"status":"ok"}"#]).await;
        let (registry, _) = registry(port);

        let err = registry.call_tool("xschem.rm_rf", &Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::Policy(PolicyError::NotAllowlisted(_))));

        let err = registry
            .call_tool("xschem.wire", &args(json!({ "x1": 0, "y1": 0, "x2": 1, "y2": 1 })))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Policy(PolicyError::ConfirmationRequired(_))));
        assert_eq!(err.kind(), "policy");

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pass_through_status_decides_is_error() {
        let (port, seen) = fake_remote(vec![
            "",
            r#"{"status":"ok","symbols":[]}"#,
            r#"{"status":"error","code":"E_NOT_FOUND","message":"no such instance"}"#,
        ])
        .await;
        let (registry, _) = registry(port);

        let ok = registry
            .call_tool("xschem.search_symbols", &Map::new())
            .await
            .unwrap();
        assert!(!ok.is_error);

        let failed = registry
            .call_tool(
                "xschem.get_instance_pins",
                &args(json!({ "instance_name": "R9" })),
            )
            .await
            .unwrap();
        assert!(failed.is_error);
        let rendered = failed.into_result();
        assert_eq!(rendered["isError"], json!(true));
        assert_eq!(rendered["structuredContent"]["code"], json!("E_NOT_FOUND"));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[1], "mcp_search_symbols {*}\n");
        assert_eq!(seen[2], "mcp_get_instance_pins {R9}\n");
    }

    #[tokio::test]
    async fn missing_argument_is_a_tool_error() {
        let (registry, _) = registry(closed_port());
        let result = registry
            .invoke("xschem.get_pin_coordinates", &args(json!({ "instance_name": "M1" })))
            .await;
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["structuredContent"]["error"]["kind"], json!("arguments"));
        assert_eq!(
            result["content"][0]["text"],
            json!("missing required argument: pin_name")
        );
    }

    #[tokio::test]
    async fn unreachable_remote_is_a_tool_error() {
        let (registry, _) = registry(closed_port());
        let result = registry.invoke("xschem.get_context", &Map::new()).await;
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["structuredContent"]["error"]["kind"], json!("remote"));
    }

    #[tokio::test]
    async fn lifecycle_tools_never_flag_not_managed() {
        let (registry, _) = registry(closed_port());
        let port = closed_port();

        let stop = registry
            .call_tool(
                "xschem.stop_process",
                &args(json!({ "tcp_port": port, "confirm": true })),
            )
            .await
            .unwrap();
        assert!(!stop.is_error);
        assert_eq!(stop.payload["status"], json!("not_managed"));

        let status = registry
            .call_tool("xschem.process_status", &Map::new())
            .await
            .unwrap();
        assert_eq!(status.payload, json!({ "managed_processes": [], "count": 0 }));

        let err = registry
            .call_tool("xschem.stop_process", &args(json!({ "confirm": true })))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingArgument("tcp_port")));
    }

    #[tokio::test]
    async fn start_on_open_port_repoints_the_remote_session() {
        let (registry, remote) = registry(closed_port());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = registry
            .call_tool(
                "xschem.start_process",
                &args(json!({ "tcp_port": port, "command": "xschem-not-installed" })),
            )
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.payload["status"], json!("already_running"));
        assert_eq!(outcome.payload["managed_by_bridge"], json!(false));
        assert_eq!(remote.port().await, port);
    }

    #[test]
    fn outcome_rendering() {
        let rendered = ToolOutcome {
            payload: json!({ "status": "ok" }),
            is_error: false,
        }
        .into_result();
        assert_eq!(
            rendered["content"][0]["text"],
            json!(r#"{"status":"ok"}"#)
        );
        assert_eq!(rendered["structuredContent"]["status"], json!("ok"));

        let scalar = ToolOutcome {
            payload: json!([1, 2]),
            is_error: false,
        }
        .into_result();
        assert!(scalar.get("structuredContent").is_none());
    }
}
