use anyhow::{Context, bail};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::remote::RemoteConfig;

const PROCS_FILE: &str = "mcp_procs.tcl";

/// XSchem MCP bridge: serves MCP tools over stdio and forwards them to an
/// XSchem Tcl command socket.
#[derive(Parser, Debug, Clone)]
#[command(name = "xschem-mcp-bridge", version)]
pub struct Cli {
    /// XSchem host; local worker ports are probed on the same host.
    #[arg(long, env = "XSCHEM_HOST", default_value = "127.0.0.1")]
    pub xschem_host: String,

    #[arg(long, env = "XSCHEM_PORT", default_value_t = 2021)]
    pub xschem_port: u16,

    /// Per-attempt timeout in seconds.
    #[arg(long, env = "XSCHEM_TIMEOUT", default_value_t = 8.0)]
    pub xschem_timeout: f64,

    /// Retries after the first attempt.
    #[arg(long, env = "XSCHEM_RETRIES", default_value_t = 2)]
    pub xschem_retries: u32,

    /// Linear backoff unit in seconds.
    #[arg(long, env = "XSCHEM_BACKOFF", default_value_t = 0.4)]
    pub xschem_backoff: f64,

    /// Tcl wrapper library sourced before the first remote call.
    /// Defaults to mcp_procs.tcl next to the executable.
    #[arg(long, env = "XSCHEM_MCP_PROCS")]
    pub xschem_procs: Option<PathBuf>,

    /// Ask XSchem for a dedicated port at startup.
    #[arg(long, env = "XSCHEM_NEGOTIATE_PORT")]
    pub negotiate_port: bool,

    /// Used when RUST_LOG is not set.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Optional JSONL audit log path.
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Disable the explicit confirm=true gate for destructive tool calls.
    #[arg(long)]
    pub allow_destructive_without_confirm: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    pub negotiate_port: bool,
    pub log_level: String,
    pub audit_log: Option<PathBuf>,
    pub require_confirmation: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if cli.xschem_port == 0 {
            bail!("--xschem-port must be between 1 and 65535");
        }
        if !(cli.xschem_timeout.is_finite() && cli.xschem_timeout > 0.0) {
            bail!("--xschem-timeout must be > 0 (got {})", cli.xschem_timeout);
        }
        let timeout = Duration::try_from_secs_f64(cli.xschem_timeout).context("--xschem-timeout")?;
        let backoff = Duration::try_from_secs_f64(cli.xschem_backoff)
            .with_context(|| format!("--xschem-backoff must be >= 0 (got {})", cli.xschem_backoff))?;

        let procs_script = match cli.xschem_procs {
            Some(path) => path,
            None => default_procs_script()?,
        };
        let procs_script = std::path::absolute(&procs_script)
            .with_context(|| format!("resolving {}", procs_script.display()))?;

        Ok(Self {
            remote: RemoteConfig {
                host: cli.xschem_host,
                port: cli.xschem_port,
                timeout,
                retries: cli.xschem_retries,
                backoff,
                procs_script,
            },
            negotiate_port: cli.negotiate_port,
            log_level: cli.log_level,
            audit_log: cli.audit_log,
            require_confirmation: !cli.allow_destructive_without_confirm,
        })
    }
}

fn default_procs_script() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("locating executable")?;
    Ok(match exe.parent() {
        Some(dir) => dir.join(PROCS_FILE),
        None => PathBuf::from(PROCS_FILE),
    })
}
