use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::ProcessError;

const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const POLL_INTERVAL: Duration = Duration::from_millis(150);
const START_TEARDOWN_GRACE: Duration = Duration::from_millis(1500);
const STOP_GRACE: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tcp_port: u16,
    pub command: String,
    pub extra_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Falls back to the bridge's own `DISPLAY`.
    pub display: Option<String>,
    pub startup_timeout: Duration,
}

impl StartRequest {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.command.clone(),
            "--tcp_port".to_string(),
            self.tcp_port.to_string(),
        ];
        argv.extend(self.extra_args.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub status: StartStatus,
    pub managed_by_bridge: bool,
    pub tcp_port: u16,
    pub pid: Option<u32>,
    pub command: Vec<String>,
    pub display: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    NotManaged,
    AlreadyStopped,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub status: StopStatus,
    pub managed_by_bridge: bool,
    pub tcp_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_open: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub tcp_port: u16,
    pub port_open: bool,
    pub managed_by_bridge: bool,
    pub pid: Option<u32>,
    pub running: bool,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub tcp_port: u16,
    pub pid: u32,
    pub running: bool,
    pub command: Vec<String>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessListing {
    pub managed_processes: Vec<ProcessSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    Port(PortStatus),
    All(ProcessListing),
}

struct ManagedProcess {
    command: Vec<String>,
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
}

impl ManagedProcess {
    fn is_running(&mut self) -> bool {
        is_alive(&mut self.child)
    }

    fn uptime_seconds(&self) -> f64 {
        let ms = (Utc::now() - self.started_at).num_milliseconds().max(0);
        ms as f64 / 1000.0
    }
}

pub struct ProcessSupervisor {
    host: String,
    processes: Mutex<HashMap<u16, ManagedProcess>>,
}

impl ProcessSupervisor {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, req: StartRequest) -> Result<StartReport, ProcessError> {
        let port = req.tcp_port;
        if req.command.trim().is_empty() {
            return Err(ProcessError::EmptyCommand { port });
        }
        let argv = req.argv();
        let display = req
            .display
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| std::env::var("DISPLAY").ok().filter(|d| !d.is_empty()))
            .unwrap_or_default();

        let mut processes = self.processes.lock().await;
        prune(&mut processes);

        // A live tracked worker keeps its slot even while its port is closed.
        let port_open = self.is_port_open(port).await;
        if port_open || processes.contains_key(&port) {
            let managed = processes.get(&port);
            debug!(tcp_port = port, port_open, managed = managed.is_some(), "port already taken");
            return Ok(StartReport {
                status: StartStatus::AlreadyRunning,
                managed_by_bridge: managed.is_some(),
                tcp_port: port,
                pid: managed.map(|m| m.pid),
                command: managed.map(|m| m.command.clone()).unwrap_or(argv),
                display,
            });
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        if !display.is_empty() {
            cmd.env("DISPLAY", &display);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            port,
            command: argv.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        if !self.wait_for_port(port, req.startup_timeout, &mut child).await {
            warn!(tcp_port = port, pid, command = ?argv, "worker did not become ready");
            if let Err(e) = shut_down(&mut child, pid, Signal::SIGTERM, START_TEARDOWN_GRACE).await {
                warn!(tcp_port = port, pid, error = %e, "failed to tear down worker");
            }
            return Err(ProcessError::NotReady {
                port,
                command: argv,
                startup_timeout: req.startup_timeout,
            });
        }

        info!(tcp_port = port, pid, command = ?argv, "started worker process");
        processes.insert(
            port,
            ManagedProcess {
                command: argv.clone(),
                child,
                pid,
                started_at: Utc::now(),
            },
        );
        Ok(StartReport {
            status: StartStatus::Started,
            managed_by_bridge: true,
            tcp_port: port,
            pid: Some(pid),
            command: argv,
            display,
        })
    }

    pub async fn stop(&self, port: u16, force: bool) -> Result<StopReport, ProcessError> {
        let mut processes = self.processes.lock().await;
        let target = processes.remove(&port);
        prune(&mut processes);

        let Some(mut managed) = target else {
            return Ok(StopReport {
                status: StopStatus::NotManaged,
                managed_by_bridge: false,
                tcp_port: port,
                port_open: Some(self.is_port_open(port).await),
                pid: None,
                force: None,
            });
        };

        if !managed.is_running() {
            debug!(tcp_port = port, pid = managed.pid, "worker already exited");
            return Ok(StopReport {
                status: StopStatus::AlreadyStopped,
                managed_by_bridge: true,
                tcp_port: port,
                port_open: None,
                pid: Some(managed.pid),
                force: None,
            });
        }

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        shut_down(&mut managed.child, managed.pid, signal, STOP_GRACE).await?;
        info!(tcp_port = port, pid = managed.pid, force, "stopped worker process");
        Ok(StopReport {
            status: StopStatus::Stopped,
            managed_by_bridge: true,
            tcp_port: port,
            port_open: None,
            pid: Some(managed.pid),
            force: Some(force),
        })
    }

    pub async fn status(&self, port: Option<u16>) -> StatusReport {
        let mut processes = self.processes.lock().await;
        prune(&mut processes);

        if let Some(port) = port {
            let port_open = self.is_port_open(port).await;
            let report = match processes.get_mut(&port) {
                Some(managed) => PortStatus {
                    tcp_port: port,
                    port_open,
                    managed_by_bridge: true,
                    pid: Some(managed.pid),
                    running: managed.is_running(),
                    command: managed.command.clone(),
                },
                None => PortStatus {
                    tcp_port: port,
                    port_open,
                    managed_by_bridge: false,
                    pid: None,
                    running: false,
                    command: Vec::new(),
                },
            };
            return StatusReport::Port(report);
        }

        let mut managed_processes: Vec<ProcessSummary> = processes
            .iter_mut()
            .map(|(port, managed)| ProcessSummary {
                tcp_port: *port,
                pid: managed.pid,
                running: managed.is_running(),
                command: managed.command.clone(),
                uptime_seconds: managed.uptime_seconds(),
            })
            .collect();
        managed_processes.sort_by_key(|p| p.tcp_port);
        StatusReport::All(ProcessListing {
            count: managed_processes.len(),
            managed_processes,
        })
    }

    async fn is_port_open(&self, port: u16) -> bool {
        matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect((self.host.as_str(), port))).await,
            Ok(Ok(_))
        )
    }

    async fn wait_for_port(&self, port: u16, limit: Duration, child: &mut Child) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if !is_alive(child) {
                return false;
            }
            if self.is_port_open(port).await {
                return true;
            }
            sleep(POLL_INTERVAL).await;
        }
        self.is_port_open(port).await
    }
}

fn is_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

fn prune(processes: &mut HashMap<u16, ManagedProcess>) {
    processes.retain(|port, managed| {
        let alive = managed.is_running();
        if !alive {
            debug!(tcp_port = *port, pid = managed.pid, "pruning exited worker");
        }
        alive
    });
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ProcessError::Signal {
            pid,
            source: errno.into(),
        }),
    }
}

async fn shut_down(
    child: &mut Child,
    pid: u32,
    first: Signal,
    grace: Duration,
) -> Result<(), ProcessError> {
    if !is_alive(child) {
        return Ok(());
    }
    send_signal(pid, first)?;
    if timeout(grace, child.wait()).await.is_ok() {
        return Ok(());
    }
    warn!(pid, "worker did not exit in time; sending SIGKILL");
    send_signal(pid, Signal::SIGKILL)?;
    if timeout(grace, child.wait()).await.is_err() {
        warn!(pid, "worker still running after SIGKILL");
    }
    Ok(())
}
