use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::SitesConfig;
use crate::error::StartError;
use crate::runtime::ProcessRuntime;

/// How site processes are launched and judged ready
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Substring on stdout meaning the server is listening
    pub ready_marker: String,
    /// Substring on stderr meaning the port is taken
    pub port_in_use_marker: String,
    pub startup_timeout: Duration,
    pub grace_period: Duration,
}

impl SupervisorConfig {
    pub fn from_sites(sites: &SitesConfig) -> Self {
        Self {
            command: sites.command.clone(),
            args: sites.args.clone(),
            env: sites.env.clone(),
            ready_marker: sites.ready_marker.clone(),
            port_in_use_marker: sites.port_in_use_marker.clone(),
            startup_timeout: sites.startup_timeout(),
            grace_period: sites.shutdown_grace_period(),
        }
    }
}

/// Sent when a site process exits without being asked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub tenant_id: String,
    pub pid: u32,
    pub port: u16,
    pub code: Option<i32>,
}

#[derive(Debug, Clone)]
struct ProcessControl {
    stop_tx: mpsc::Sender<()>,
    exited: watch::Receiver<bool>,
}

/// Handle to a live site process. The child itself is owned by a monitor task
#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub tenant_id: String,
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub url: String,
    control: ProcessControl,
}

impl RunningProcess {
    pub fn has_exited(&self) -> bool {
        *self.control.exited.borrow()
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Starts site processes, watches them, and stops them
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    runtime: Arc<dyn ProcessRuntime>,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiver for unexpected exits
    pub fn new(
        config: SupervisorConfig,
        runtime: Arc<dyn ProcessRuntime>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            config,
            runtime,
            exits_tx,
        });
        (supervisor, exits_rx)
    }

    /// Spawn a site process and wait until it reports ready
    pub async fn start(
        &self,
        tenant_id: &str,
        work_dir: &Path,
        port: u16,
        env: &HashMap<String, String>,
    ) -> Result<RunningProcess, StartError> {
        let program = self.runtime.resolve_program(&self.config.command);
        info!(tenant = %tenant_id, port, command = %program, "Starting site process");

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("PORT", port.to_string());
        cmd.env("TENANT_ID", tenant_id);

        let mut child = cmd.spawn().map_err(StartError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        debug!(tenant = %tenant_id, pid, "Site process spawned");

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, Stream::Stdout, tenant_id.to_string(), line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, Stream::Stderr, tenant_id.to_string(), line_tx));
        }

        let timeout = self.config.startup_timeout;
        let waited = tokio::time::timeout(
            timeout,
            self.wait_for_ready(&mut child, &mut line_rx, port),
        )
        .await;

        let failure = match waited {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(StartError::Timeout(timeout.as_secs())),
        };
        if let Some(e) = failure {
            warn!(tenant = %tenant_id, pid, port, error = %e, "Site process failed to start");
            let _ = child.kill().await;
            return Err(e);
        }

        info!(tenant = %tenant_id, pid, port, "Site process ready");

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(monitor(
            child,
            ProcessExit {
                tenant_id: tenant_id.to_string(),
                pid,
                port,
                code: None,
            },
            Arc::clone(&self.runtime),
            self.config.grace_period,
            stop_rx,
            exited_tx,
            self.exits_tx.clone(),
        ));

        Ok(RunningProcess {
            tenant_id: tenant_id.to_string(),
            pid,
            port,
            started_at: Utc::now(),
            url: format!("http://localhost:{}", port),
            control: ProcessControl {
                stop_tx,
                exited: exited_rx,
            },
        })
    }

    async fn wait_for_ready(
        &self,
        child: &mut Child,
        lines: &mut mpsc::UnboundedReceiver<(Stream, String)>,
        port: u16,
    ) -> Result<(), StartError> {
        loop {
            tokio::select! {
                biased;

                Some((stream, line)) = lines.recv() => {
                    match stream {
                        Stream::Stdout if line.contains(&self.config.ready_marker) => return Ok(()),
                        Stream::Stderr if line.contains(&self.config.port_in_use_marker) => {
                            return Err(StartError::PortInUse { port });
                        }
                        _ => {}
                    }
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    return Err(StartError::ProcessExit { code });
                }
            }
        }
    }

    /// Stop a process: termination signal, grace period, then kill.
    /// Returns once the process is gone. Safe to call repeatedly
    pub async fn stop(&self, process: &RunningProcess) {
        let mut exited = process.control.exited.clone();
        if *exited.borrow() {
            debug!(tenant = %process.tenant_id, pid = process.pid, "Site process already exited");
            return;
        }

        // A full buffer means a stop is already in flight
        let _ = process.control.stop_tx.try_send(());
        let _ = exited.wait_for(|done| *done).await;
    }
}

async fn forward_output<R>(
    reader: R,
    stream: Stream,
    tenant_id: String,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(tenant = %tenant_id, ?stream, "{}", line);
        // Nobody listens once the process is ready; keep logging
        let _ = tx.send((stream, line));
    }
}

async fn monitor(
    mut child: Child,
    mut exit: ProcessExit,
    runtime: Arc<dyn ProcessRuntime>,
    grace_period: Duration,
    mut stop_rx: mpsc::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
) {
    tokio::select! {
        status = child.wait() => {
            exit.code = status.ok().and_then(|s| s.code());
            warn!(tenant = %exit.tenant_id, pid = exit.pid, port = exit.port, code = ?exit.code, "Site process exited unexpectedly");
            let _ = exits_tx.send(exit);
        }
        _ = stop_rx.recv() => {
            terminate(&*runtime, &mut child, grace_period, &exit).await;
        }
    }

    let _ = exited_tx.send(true);
}

async fn terminate(runtime: &dyn ProcessRuntime, child: &mut Child, grace_period: Duration, exit: &ProcessExit) {
    info!(tenant = %exit.tenant_id, pid = exit.pid, runtime = runtime.name(), "Sending termination signal to site process");
    if let Err(e) = runtime.terminate(child) {
        warn!(tenant = %exit.tenant_id, pid = exit.pid, error = %e, "Failed to signal site process");
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(tenant = %exit.tenant_id, pid = exit.pid, ?status, "Site process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(tenant = %exit.tenant_id, pid = exit.pid, error = %e, "Error waiting for site process to exit");
        }
        Err(_) => {
            warn!(
                tenant = %exit.tenant_id,
                pid = exit.pid,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, killing site process"
            );
            let _ = child.kill().await;
        }
    }
}
