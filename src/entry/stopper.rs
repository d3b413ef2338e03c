//! Lets a running node stop the whole program it belongs to.
//!
//! Under ssh the node leaves a [`StopReport`] next to its artifact and kills
//! its own multiplexer session; the supervisor reads the report once the
//! session's panes are gone. A local subprocess signals the launcher, and an
//! in-process entry asks its supervisor directly.

use crate::launch::shell::{RemoteShell, SystemShell};
use crate::supervisor::SupervisorHandle;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Set by the launcher on every worker it starts: `local` or `ssh`.
pub const LAUNCH_TYPE_ENV: &str = "TLAUNCH_LAUNCH_TYPE";
pub const LAUNCHER_PID_ENV: &str = "TLAUNCH_LAUNCHER_PID";
pub const MULTIPLEXER_ENV: &str = "TLAUNCH_MULTIPLEXER";

pub const LAUNCH_TYPE_LOCAL: &str = "local";
pub const LAUNCH_TYPE_SSH: &str = "ssh";

const STOP_REPORT_FILE: &str = "stop-report.json";

/// Left by the node that stopped the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Title of the stopping node, `{group}/{index}`.
    pub worker: String,
    /// Set when the node stopped the program because it failed.
    #[serde(default)]
    pub failure: Option<String>,
}

impl StopReport {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(STOP_REPORT_FILE)
    }

    /// `None` when no report was written. An unreadable report is logged and
    /// treated as absent.
    pub async fn read(path: &Path) -> Option<Self> {
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable stop report");
                None
            }
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path(dir);
        let bytes = serde_json::to_vec(self).context("failed to serialize stop report")?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write stop report {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Clone)]
pub enum ProgramStopper {
    /// A subprocess of a local launcher: SIGTERM to the launching process.
    Local { launcher_pid: u32 },
    /// A pane of a multiplexer session opened by the ssh launcher.
    Session {
        shell: Arc<dyn RemoteShell>,
        multiplexer: String,
        report_dir: PathBuf,
        worker: String,
    },
    /// An in-process entry supervised from the same runtime.
    Supervisor(SupervisorHandle),
    /// Launched somewhere that offers no way back to the launcher.
    Unavailable,
}

impl fmt::Debug for ProgramStopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { launcher_pid } => f
                .debug_struct("Local")
                .field("launcher_pid", launcher_pid)
                .finish(),
            Self::Session {
                multiplexer,
                report_dir,
                worker,
                ..
            } => f
                .debug_struct("Session")
                .field("multiplexer", multiplexer)
                .field("report_dir", report_dir)
                .field("worker", worker)
                .finish(),
            Self::Supervisor(_) => f.write_str("Supervisor"),
            Self::Unavailable => f.write_str("Unavailable"),
        }
    }
}

impl ProgramStopper {
    /// Stopper for a worker process, chosen from the variables its launcher
    /// set. `data_file` is the artifact the worker was started with.
    pub fn from_env(data_file: &Path, worker: &str) -> Self {
        Self::from_vars(|key| std::env::var(key).ok(), data_file, worker)
    }

    pub fn from_vars<F>(lookup: F, data_file: &Path, worker: &str) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(LAUNCH_TYPE_ENV).as_deref() {
            Some(LAUNCH_TYPE_LOCAL) => {
                match lookup(LAUNCHER_PID_ENV).and_then(|pid| pid.trim().parse().ok()) {
                    Some(launcher_pid) => Self::Local { launcher_pid },
                    None => {
                        tracing::warn!("{LAUNCHER_PID_ENV} is missing or invalid; program stop disabled");
                        Self::Unavailable
                    }
                }
            }
            Some(LAUNCH_TYPE_SSH) => Self::Session {
                shell: Arc::new(SystemShell),
                multiplexer: lookup(MULTIPLEXER_ENV).unwrap_or_else(|| "tmux".to_string()),
                report_dir: data_file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
                worker: worker.to_string(),
            },
            _ => Self::Unavailable,
        }
    }

    /// Asks for every node of the program to be stopped. The job resolves
    /// cleanly unless some other node already failed.
    ///
    /// A local launcher only survives the signal when it handles SIGTERM,
    /// as [`crate::Runner::run_until_ctrl_c`] does.
    pub async fn stop_program(&self) -> Result<()> {
        match self {
            Self::Local { launcher_pid } => signal_launcher(*launcher_pid),
            Self::Session { .. } => self.kill_own_session(None).await,
            Self::Supervisor(supervisor) => supervisor.shutdown(),
            Self::Unavailable => bail!("this launch offers no way to stop the program from a node"),
        }
    }

    /// Stops the program because this node failed with `error`. Launchers
    /// that already see the node's exit status need nothing more.
    pub async fn stop_after_failure(&self, error: &anyhow::Error) -> Result<()> {
        match self {
            Self::Session { .. } => self.kill_own_session(Some(format!("{error:#}"))).await,
            Self::Local { .. } | Self::Supervisor(_) | Self::Unavailable => Ok(()),
        }
    }

    async fn kill_own_session(&self, failure: Option<String>) -> Result<()> {
        let Self::Session {
            shell,
            multiplexer,
            report_dir,
            worker,
        } = self
        else {
            bail!("not running inside a launcher session");
        };

        let session = current_session(shell.as_ref(), multiplexer).await?;
        StopReport {
            worker: worker.clone(),
            failure,
        }
        .write(report_dir)?;

        tracing::info!(session = %session, worker = %worker, "stopping program by killing its session");
        let command = vec![
            multiplexer.clone(),
            "kill-session".to_string(),
            "-t".to_string(),
            session.clone(),
        ];
        let output = shell.run(&command).await?;
        if !output.success() {
            bail!("failed to kill session {session}: {}", output.combined().trim());
        }
        Ok(())
    }
}

/// Name of the session the calling pane belongs to.
async fn current_session(shell: &dyn RemoteShell, multiplexer: &str) -> Result<String> {
    let command = vec![
        multiplexer.to_string(),
        "display-message".to_string(),
        "-p".to_string(),
        "#S".to_string(),
    ];
    let output = shell
        .run(&command)
        .await
        .with_context(|| format!("failed to ask {multiplexer} for the current session"))?;
    if !output.success() {
        bail!(
            "{multiplexer} could not name the current session: {}",
            output.combined().trim()
        );
    }
    let session = output.stdout.trim().trim_matches('\'').to_string();
    if session.is_empty() {
        bail!("{multiplexer} reported an empty session name");
    }
    Ok(session)
}

#[cfg(unix)]
fn signal_launcher(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).with_context(|| format!("launcher pid {pid} is out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .with_context(|| format!("failed to signal launcher {pid}"))?;
    tracing::info!(launcher_pid = pid, "asked the launcher to stop the program");
    Ok(())
}

#[cfg(not(unix))]
fn signal_launcher(pid: u32) -> Result<()> {
    bail!("cannot signal launcher {pid} on this platform")
}
