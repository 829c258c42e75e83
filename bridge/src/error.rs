use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("tool not allowlisted: {0}")]
    NotAllowlisted(String),

    #[error("invalid argument {key}: {reason}")]
    InvalidArgument { key: String, reason: String },

    #[error("tool requires explicit confirmation (confirm=true): {0}")]
    ConfirmationRequired(String),
}

impl PolicyError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        PolicyError::InvalidArgument {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            PolicyError::NotAllowlisted(_) | PolicyError::ConfirmationRequired(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote command failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: std::io::Error,
    },

    #[error("remote command did not return JSON: {response:?}")]
    NotJson { response: String },

    #[error("invalid port negotiation response: {response:?}")]
    BadNegotiation { response: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("empty command for tcp_port={port}")]
    EmptyCommand { port: u16 },

    #[error("failed to spawn {command:?} for tcp_port={port}: {source}")]
    Spawn {
        port: u16,
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "process failed to become ready on tcp_port={port} (command={command:?}, startup_timeout_seconds={})",
        .startup_timeout.as_secs_f64()
    )]
    NotReady {
        port: u16,
        command: Vec<String>,
        startup_timeout: Duration,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Policy(_) => "policy",
            ToolError::Remote(_) => "remote",
            ToolError::Process(_) => "process",
            ToolError::MissingArgument(_) | ToolError::InvalidArguments(_) => "arguments",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("malformed {table} table: {source}")]
    Malformed {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("tool name is not namespaced (expected `namespace.tool`): {0}")]
    InvalidName(String),

    #[error("tool has no policy entry: {0}")]
    MissingPolicy(String),

    #[error("policy entry has no catalog tool: {0}")]
    OrphanPolicy(String),

    #[error("no handler is compiled in for tool: {0}")]
    UnknownTool(String),

    #[error("tool {name} is handled locally but its policy names remote action {action:?}")]
    UnexpectedRemoteAction { name: String, action: String },

    #[error("pass-through tool {0} has no remote action")]
    MissingRemoteAction(String),
}
