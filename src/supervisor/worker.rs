use crate::entry::stopper::StopReport;
use crate::launch::shell::{remote_argv, RemoteShell};
use anyhow::{anyhow, Result};
use std::any::Any;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How the supervisor observes one worker.
pub enum WorkerKind {
    /// An entry running as a task inside the launching process.
    Task(JoinHandle<Result<()>>),
    /// A subprocess on this host, spawned as its own process group leader.
    Process(Child),
    /// A process on another host, probed over ssh. `stop_report` is where a
    /// node that stopped the program leaves its [`StopReport`].
    Remote {
        host: String,
        port: Option<u16>,
        pid: u32,
        stop_report: Option<PathBuf>,
    },
}

pub struct WorkerRecord {
    label: String,
    kind: WorkerKind,
}

#[derive(Debug)]
pub(crate) enum Liveness {
    Alive,
    Exited,
    Failed(anyhow::Error),
    /// The probe could not confirm the worker. Dead, but not a failure.
    Lost(String),
    /// Gone because a node stopped the program.
    Stopped(StopReport),
}

impl WorkerRecord {
    pub fn task(label: impl Into<String>, handle: JoinHandle<Result<()>>) -> Self {
        Self {
            label: label.into(),
            kind: WorkerKind::Task(handle),
        }
    }

    pub fn process(label: impl Into<String>, child: Child) -> Self {
        Self {
            label: label.into(),
            kind: WorkerKind::Process(child),
        }
    }

    pub fn remote(label: impl Into<String>, host: impl Into<String>, port: Option<u16>, pid: u32) -> Self {
        Self {
            label: label.into(),
            kind: WorkerKind::Remote {
                host: host.into(),
                port,
                pid,
                stop_report: None,
            },
        }
    }

    /// Consults the report at `path` when a remote worker disappears.
    pub fn with_stop_report(mut self, path: PathBuf) -> Self {
        if let WorkerKind::Remote { stop_report, .. } = &mut self.kind {
            *stop_report = Some(path);
        }
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    pub(crate) async fn check(&mut self, shell: &dyn RemoteShell, probe_timeout: Duration) -> Liveness {
        match &mut self.kind {
            WorkerKind::Task(handle) => {
                if !handle.is_finished() {
                    return Liveness::Alive;
                }
                match handle.await {
                    Ok(Ok(())) => Liveness::Exited,
                    Ok(Err(err)) => Liveness::Failed(err),
                    Err(err) if err.is_panic() => {
                        let panic = err.into_panic();
                        Liveness::Failed(anyhow!("task panicked: {}", panic_message(panic.as_ref())))
                    }
                    Err(_) => Liveness::Exited,
                }
            }
            WorkerKind::Process(child) => match child.try_wait() {
                Ok(None) => Liveness::Alive,
                Ok(Some(status)) if status.success() => Liveness::Exited,
                Ok(Some(status)) => Liveness::Failed(anyhow!("process exited with {status}")),
                Err(err) => Liveness::Failed(anyhow!("failed to poll process: {err}")),
            },
            WorkerKind::Remote {
                host,
                port,
                pid,
                stop_report,
            } => {
                let argv = remote_argv(host, *port, &probe_command(*pid));
                let reason = match timeout(probe_timeout, shell.run(&argv)).await {
                    Ok(Ok(output)) if output.success() => return Liveness::Alive,
                    Ok(Ok(output)) => format!("pid {pid} not found on {host} (status {:?})", output.status),
                    Ok(Err(err)) => format!("probe on {host} failed: {err}"),
                    Err(_) => format!("probe on {host} timed out after {probe_timeout:?}"),
                };
                if let Some(path) = stop_report.as_deref() {
                    if let Some(report) = StopReport::read(path).await {
                        return Liveness::Stopped(report);
                    }
                }
                Liveness::Lost(reason)
            }
        }
    }

    /// Sends the termination notice: SIGTERM to a subprocess group. Tasks are
    /// stopped through their shutdown token and remote workers through the
    /// backend's session teardown, so both are left alone here.
    pub(crate) fn notify_termination(&self) {
        #[cfg(unix)]
        if let WorkerKind::Process(child) = &self.kind {
            if let Some(pid) = child.id() {
                signal_group(pid, nix::sys::signal::Signal::SIGTERM, &self.label);
            }
        }
    }

    /// Hard stop after the grace period.
    pub(crate) fn force_stop(&mut self) {
        match &mut self.kind {
            WorkerKind::Task(handle) => handle.abort(),
            WorkerKind::Process(child) => {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL, &self.label);
                }
                if let Err(err) = child.start_kill() {
                    tracing::debug!(worker = %self.label, error = %err, "kill after grace period failed");
                }
            }
            WorkerKind::Remote { .. } => {}
        }
    }
}

/// Process-existence check run on the worker's host.
pub fn probe_command(pid: u32) -> Vec<String> {
    vec!["kill".to_string(), "-0".to_string(), pid.to_string()]
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal, label: &str) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), signal) {
        tracing::debug!(worker = label, pid, signal = ?signal, error = %err, "failed to signal process group");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
