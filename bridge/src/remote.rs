use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RemoteError;

pub const NEGOTIATE_COMMAND: &str = "setup_tcp_xschem 0";

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
    /// Wrapper library loaded once with `source {path}` before the first call.
    pub procs_script: PathBuf,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2021,
            timeout: Duration::from_secs(8),
            retries: 2,
            backoff: Duration::from_millis(400),
            procs_script: PathBuf::from("mcp_procs.tcl"),
        }
    }
}

struct Session {
    port: u16,
    procs_loaded: bool,
}

pub struct RemoteClient {
    host: String,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
    procs_script: PathBuf,
    session: Mutex<Session>,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            host: config.host,
            timeout: config.timeout,
            retries: config.retries,
            backoff: config.backoff,
            procs_script: config.procs_script,
            session: Mutex::new(Session {
                port: config.port,
                procs_loaded: false,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn port(&self) -> u16 {
        self.session.lock().await.port
    }

    pub async fn set_port(&self, port: u16) {
        let mut session = self.session.lock().await;
        if session.port != port {
            info!(from = session.port, to = port, "repointing remote session");
            session.port = port;
        }
    }

    #[cfg(test)]
    async fn run_command(&self, command: &str) -> Result<String, RemoteError> {
        let session = self.session.lock().await;
        self.send_with_retry(session.port, command).await
    }

    pub async fn run_wrapper(&self, action: &str, args: &[Value]) -> Result<Value, RemoteError> {
        let mut session = self.session.lock().await;

        if !session.procs_loaded {
            let path = self.procs_script.display().to_string();
            info!(path = %path, "sourcing remote wrapper procs");
            let bootstrap = format!("source {}", brace_quote(&path));
            self.send_with_retry(session.port, &bootstrap).await?;
            session.procs_loaded = true;
        }

        let command = encode_command(action, args);
        let response = self.send_with_retry(session.port, &command).await?;
        let response = response.trim();
        serde_json::from_str(response).map_err(|_| RemoteError::NotJson {
            response: response.to_string(),
        })
    }

    pub async fn negotiate_port(&self) -> Result<u16, RemoteError> {
        let mut session = self.session.lock().await;
        let response = self.send_with_retry(session.port, NEGOTIATE_COMMAND).await?;
        let port = response
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| RemoteError::BadNegotiation {
                response: response.clone(),
            })?;
        session.port = port;
        info!(port, "negotiated remote port");
        Ok(port)
    }

    async fn send_with_retry(&self, port: u16, command: &str) -> Result<String, RemoteError> {
        let attempts = self.retries.saturating_add(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.send_once(port, command).await {
                Ok(response) => return Ok(response),
                Err(last_error) if attempt >= attempts => {
                    return Err(RemoteError::RetriesExhausted {
                        attempts: attempt,
                        last_error,
                    });
                }
                Err(e) => {
                    let delay = self.backoff * attempt;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        tcp_port = port,
                        error = %e,
                        "remote command failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(&self, port: u16, command: &str) -> io::Result<String> {
        debug!(tcp_port = port, command, "sending remote command");
        let mut stream = within(
            self.timeout,
            "connect",
            TcpStream::connect((self.host.as_str(), port)),
        )
        .await?;

        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        within(self.timeout, "write", stream.write_all(line.as_bytes())).await?;
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "half-close failed");
        }

        // The timeout bounds silence between reads, not the whole reply.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = within(self.timeout, "read", stream.read(&mut chunk)).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

async fn within<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out after {:.1}s", limit.as_secs_f64()),
        )),
    }
}

pub fn encode_command(action: &str, args: &[Value]) -> String {
    let mut out = action.to_string();
    for arg in args {
        out.push(' ');
        out.push_str(&encode_arg(arg));
    }
    out
}

/// Tcl brace quoting. Sequences nest as lists of their encoded elements.
pub fn encode_arg(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(encode_arg).collect();
            format!("{{{}}}", inner.join(" "))
        }
        Value::String(s) => brace_quote(s),
        Value::Number(n) => brace_quote(&n.to_string()),
        Value::Bool(b) => brace_quote(if *b { "1" } else { "0" }),
        Value::Null => "{}".to_string(),
        Value::Object(_) => brace_quote(&value.to_string()),
    }
}

fn brace_quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('{');
    for c in raw.chars() {
        if matches!(c, '\\' | '{' | '}') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('}');
    out
}
