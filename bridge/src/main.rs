use anyhow::Context;
use bridge_protocol::Transport;
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};

use xschem_bridge::catalog::Catalog;
use xschem_bridge::config::{Cli, Config};
use xschem_bridge::dispatcher::Dispatcher;
use xschem_bridge::logging;
use xschem_bridge::registry::ToolRegistry;
use xschem_bridge::remote::RemoteClient;
use xschem_bridge::server;
use xschem_bridge::supervisor::ProcessSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_cli(Cli::parse())?;
    logging::init(&cfg.log_level, cfg.audit_log.as_deref())?;

    let catalog = Arc::new(Catalog::load_embedded().context("loading tool catalog")?);
    if !cfg.remote.procs_script.exists() {
        warn!(
            path = %cfg.remote.procs_script.display(),
            "wrapper library not found; remote tool calls will fail to bootstrap"
        );
    }

    let remote = Arc::new(RemoteClient::new(cfg.remote.clone()));
    if cfg.negotiate_port {
        if let Err(e) = remote.negotiate_port().await {
            warn!(
                tcp_port = cfg.remote.port,
                error = %e,
                "port negotiation failed; continuing with configured port"
            );
        }
    }

    let supervisor = ProcessSupervisor::new(remote.host());
    let registry = ToolRegistry::new(
        catalog.clone(),
        remote.clone(),
        supervisor,
        cfg.require_confirmation,
    );
    info!(
        tools = catalog.entries().len(),
        host = %remote.host(),
        tcp_port = remote.port().await,
        require_confirmation = cfg.require_confirmation,
        "xschem mcp bridge started"
    );

    let dispatcher = Arc::new(Dispatcher::new(registry));
    let mut transport = Transport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    tokio::select! {
        res = server::serve(dispatcher, &mut transport) => res.context("stdio transport failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
    }
    Ok(())
}
