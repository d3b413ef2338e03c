//! Launches every node in a tmux window on its host. One session is opened
//! per unique host; each pane's pid is then handed to the supervisor, which
//! probes it over ssh.

use super::command::{ensure_executable, shell_quote, worker_commands, LaunchCommand};
use super::shell::{remote_argv, RemoteShell, SystemShell};
use super::{ensure_not_empty, staging_dir, LaunchError};
use crate::entry::artifact::{artifact_path, stage_program};
use crate::entry::stopper::{StopReport, LAUNCH_TYPE_ENV, LAUNCH_TYPE_SSH, MULTIPLEXER_ENV};
use crate::program::node::parse_host;
use crate::program::Program;
use crate::runtime::config::LaunchConfig;
use crate::supervisor::terminate::Terminate;
use crate::supervisor::worker::WorkerRecord;
use crate::supervisor::{SupervisorHandle, SupervisorOptions};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tempfile::TempDir;

/// Multiplexer output that signals a session name collision.
const DUPLICATE_SESSION: &str = "duplicate session";
const MAX_SESSION_ATTEMPTS: usize = 100;

/// A tmux session opened by the launcher on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
}

pub struct SshLauncher {
    config: LaunchConfig,
    shell: Arc<dyn RemoteShell>,
    staging: TempDir,
    options: SupervisorOptions,
    sessions: Vec<RemoteSession>,
}

impl SshLauncher {
    pub fn new(config: LaunchConfig) -> Result<Self> {
        Self::with_shell(config, Arc::new(SystemShell))
    }

    pub fn with_shell(config: LaunchConfig, shell: Arc<dyn RemoteShell>) -> Result<Self> {
        let staging = staging_dir(&config)?;
        Ok(Self {
            options: SupervisorOptions::from(&config),
            config,
            shell,
            staging,
            sessions: Vec::new(),
        })
    }

    /// Sessions opened by the last launch.
    pub fn sessions(&self) -> &[RemoteSession] {
        &self.sessions
    }

    pub fn bind(&self, program: &mut Program) -> Result<()> {
        let (default_host, default_port) = parse_host(self.config.default_host())?;
        for node in program.nodes_mut() {
            if node.host().is_none() {
                node.set_host(default_host.clone());
                node.set_ssh_port(default_port);
            }
            let host = node.host().unwrap_or(default_host.as_str()).to_string();
            for address in node.addresses() {
                address.bind_host(host.clone())?;
            }
        }
        Ok(())
    }

    /// Fails with [`LaunchError::CrossHostGroup`] before producing anything if
    /// a group spans several hosts.
    pub fn commands(&self, program: &Program) -> Result<Vec<LaunchCommand>> {
        let (default_host, default_port) = parse_host(self.config.default_host())?;
        let target = |host: Option<&str>, port: Option<u16>| match host {
            Some(host) => (host.to_string(), port),
            None => (default_host.clone(), default_port),
        };

        for group in program.groups() {
            let mut hosts: Vec<(String, Option<u16>)> = Vec::new();
            for node in group.nodes() {
                let host = target(node.host(), node.ssh_port());
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
            if hosts.len() > 1 {
                return Err(LaunchError::CrossHostGroup {
                    group: group.label().to_string(),
                    hosts: hosts.into_iter().map(|(host, port)| host_label(&host, port)).collect(),
                }
                .into());
            }
        }

        let staging = self.staging.path();
        Ok(worker_commands(
            program,
            &self.config,
            &[
                (LAUNCH_TYPE_ENV, LAUNCH_TYPE_SSH.to_string()),
                (MULTIPLEXER_ENV, self.config.multiplexer().to_string()),
            ],
            |label| artifact_path(staging, label).display().to_string(),
            |host| host.unwrap_or(default_host.as_str()).to_string(),
        ))
    }

    pub async fn launch(&mut self, program: &mut Program) -> Result<SupervisorHandle> {
        ensure_not_empty(program)?;
        let commands = self.commands(program)?;
        // Workers read the binary and artifacts from the same paths as here.
        ensure_executable(self.config.worker_binary())?;
        stage_program(program, self.staging.path())?;
        let stop_report = StopReport::path(self.staging.path());
        if stop_report.exists() {
            std::fs::remove_file(&stop_report).with_context(|| {
                format!("failed to clear stop report {}", stop_report.display())
            })?;
        }

        let launch_dir = self.config.launch_dir().display().to_string();
        let base_name = session_base_name(self.config.session_prefix(), program.name());
        let multiplexer = self.config.multiplexer().to_string();

        let mut sessions: Vec<RemoteSession> = Vec::new();
        for command in &commands {
            let known = sessions
                .iter()
                .any(|session| session.host == command.host() && session.port == command.port());
            if known {
                continue;
            }
            let name = match open_session(
                self.shell.as_ref(),
                command.host(),
                command.port(),
                &multiplexer,
                &base_name,
                &launch_dir,
            )
            .await
            {
                Ok(name) => name,
                Err(err) => {
                    kill_remote_sessions(self.shell.as_ref(), &multiplexer, &sessions).await;
                    return Err(err);
                }
            };
            tracing::info!(
                host = command.host(),
                session = %name,
                "opened {multiplexer} session; attach with `{multiplexer} a -t {name}`"
            );
            sessions.push(RemoteSession {
                host: command.host().to_string(),
                port: command.port(),
                name,
            });
        }
        self.sessions = sessions.clone();

        for command in &commands {
            let Some(session) = sessions
                .iter()
                .find(|session| session.host == command.host() && session.port == command.port())
            else {
                bail!("no session opened for host {}", command.host());
            };
            let argv = remote_argv(
                command.host(),
                command.port(),
                &new_window_command(&multiplexer, &session.name, command, &launch_dir),
            );
            let window = self.shell.run(&argv).await;
            let failure = match window {
                Ok(output) if output.success() => None,
                Ok(output) => Some(anyhow::anyhow!(output.combined().trim().to_string())),
                Err(err) => Some(err),
            };
            if let Some(err) = failure {
                kill_remote_sessions(self.shell.as_ref(), &multiplexer, &sessions).await;
                return Err(err.context(format!(
                    "failed to open window {} on {}",
                    command.title(),
                    command.host()
                )));
            }
            tracing::debug!(worker = command.title(), host = command.host(), "opened window");
        }

        let terminator = SessionTerminator {
            shell: self.shell.clone(),
            multiplexer: multiplexer.clone(),
            sessions: sessions.clone(),
        };
        let supervisor = SupervisorHandle::spawn(self.options, self.shell.clone(), Arc::new(terminator));

        for session in &sessions {
            supervisor.record_session_opened();
            let panes = match list_panes(self.shell.as_ref(), &multiplexer, session).await {
                Ok(panes) => panes,
                Err(err) => {
                    let _ = supervisor.shutdown();
                    let _ = supervisor.seal();
                    return Err(err);
                }
            };
            for (pid, window) in panes {
                let label = if window.is_empty() {
                    format!("{}/pane-{pid}", session.host)
                } else {
                    window
                };
                tracing::debug!(worker = %label, host = %session.host, pid, "registering remote worker");
                supervisor.register(
                    WorkerRecord::remote(label, session.host.clone(), session.port, pid)
                        .with_stop_report(stop_report.clone()),
                )?;
            }
        }

        supervisor.seal()?;
        Ok(supervisor)
    }
}

/// Session name for a program: prefix plus the program name with anything
/// tmux treats specially replaced.
pub fn session_base_name(prefix: &str, program: &str) -> String {
    let program: String = program
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    if program.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}-{program}")
    }
}

/// Creates a detached session, probing `base`, `base_0`, `base_1`, ... while
/// the multiplexer reports a duplicate. Any other failure is fatal.
pub async fn open_session(
    shell: &dyn RemoteShell,
    host: &str,
    port: Option<u16>,
    multiplexer: &str,
    base: &str,
    launch_dir: &str,
) -> Result<String> {
    let mut name = base.to_string();
    for suffix in 0..MAX_SESSION_ATTEMPTS {
        let command = vec![
            multiplexer.to_string(),
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            name.clone(),
            "-c".to_string(),
            launch_dir.to_string(),
        ];
        let output = shell
            .run(&remote_argv(host, port, &command))
            .await
            .with_context(|| format!("failed to reach {}", host_label(host, port)))?;
        if output.success() {
            return Ok(name);
        }

        let text = output.combined();
        if !text.contains(DUPLICATE_SESSION) {
            return Err(LaunchError::SessionCreate {
                host: host_label(host, port),
                session: name,
                output: text,
            }
            .into());
        }
        tracing::info!(host, session = %name, "session already exists, trying to uniquify");
        name = format!("{base}_{suffix}");
    }

    Err(LaunchError::SessionCreate {
        host: host_label(host, port),
        session: name,
        output: format!("gave up after {MAX_SESSION_ATTEMPTS} duplicate session names"),
    }
    .into())
}

/// The window runs the command, echoes it for copy-paste, then keeps an
/// interactive shell open so the pane survives for inspection.
fn new_window_command(
    multiplexer: &str,
    session: &str,
    command: &LaunchCommand,
    launch_dir: &str,
) -> Vec<String> {
    let line = command.shell_line();
    vec![
        multiplexer.to_string(),
        "new-window".to_string(),
        "-t".to_string(),
        session.to_string(),
        "-n".to_string(),
        command.title().to_string(),
        "-c".to_string(),
        launch_dir.to_string(),
        format!("{line}; echo {}; exec $SHELL; ", shell_quote(&line)),
    ]
}

async fn list_panes(
    shell: &dyn RemoteShell,
    multiplexer: &str,
    session: &RemoteSession,
) -> Result<Vec<(u32, String)>> {
    let command = vec![
        multiplexer.to_string(),
        "list-panes".to_string(),
        "-t".to_string(),
        session.name.clone(),
        "-s".to_string(),
        "-F".to_string(),
        "#{pane_pid} #{window_name}".to_string(),
    ];
    let output = shell
        .run(&remote_argv(&session.host, session.port, &command))
        .await
        .with_context(|| format!("failed to list panes on {}", session.host))?;
    if !output.success() {
        bail!(
            "failed to list panes of session {} on {}: {}",
            session.name,
            session.host,
            output.combined().trim()
        );
    }
    parse_panes(&output.stdout)
}

/// Parses `list-panes` lines of the form `PID [WINDOW]`.
pub fn parse_panes(stdout: &str) -> Result<Vec<(u32, String)>> {
    stdout
        .lines()
        .map(|line| line.trim().trim_matches('"'))
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (pid, window) = line.split_once(' ').unwrap_or((line, ""));
            let pid = pid
                .parse::<u32>()
                .with_context(|| format!("invalid pane pid in {line:?}"))?;
            Ok((pid, window.trim().to_string()))
        })
        .collect()
}

fn host_label(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

async fn kill_remote_sessions(shell: &dyn RemoteShell, multiplexer: &str, sessions: &[RemoteSession]) {
    for session in sessions {
        let command = vec![
            multiplexer.to_string(),
            "kill-session".to_string(),
            "-t".to_string(),
            session.name.clone(),
        ];
        match shell
            .run(&remote_argv(&session.host, session.port, &command))
            .await
        {
            Ok(output) if output.success() => {
                tracing::info!(host = %session.host, session = %session.name, "killed session");
            }
            Ok(output) => tracing::warn!(
                host = %session.host,
                session = %session.name,
                output = %output.combined().trim(),
                "failed to kill session"
            ),
            Err(err) => tracing::warn!(
                host = %session.host,
                session = %session.name,
                error = %err,
                "failed to kill session"
            ),
        }
    }
}

struct SessionTerminator {
    shell: Arc<dyn RemoteShell>,
    multiplexer: String,
    sessions: Vec<RemoteSession>,
}

impl Terminate for SessionTerminator {
    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(kill_remote_sessions(
            self.shell.as_ref(),
            &self.multiplexer,
            &self.sessions,
        ))
    }
}

/// Kills leftover sessions on each `host[:port]`: every session whose name
/// starts with `prefix`, or the whole multiplexer server when `kill_all` is
/// set. Unreachable hosts are logged and skipped. Returns the killed session
/// names as `host:session`.
pub async fn kill_sessions(
    shell: &dyn RemoteShell,
    hosts: &[String],
    prefix: &str,
    multiplexer: &str,
    kill_all: bool,
) -> Result<Vec<String>> {
    let mut killed = Vec::new();
    for entry in hosts {
        let (host, port) = parse_host(entry)?;

        if kill_all {
            let command = vec![multiplexer.to_string(), "kill-server".to_string()];
            match shell.run(&remote_argv(&host, port, &command)).await {
                Ok(output) if output.success() => {
                    tracing::info!(host = %entry, "killed every session");
                    killed.push(format!("{entry}:*"));
                }
                Ok(output) => {
                    tracing::warn!(host = %entry, output = %output.combined().trim(), "kill-server failed")
                }
                Err(err) => tracing::warn!(host = %entry, error = %err, "kill-server failed"),
            }
            continue;
        }

        let list = vec![multiplexer.to_string(), "ls".to_string()];
        let output = match shell.run(&remote_argv(&host, port, &list)).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                tracing::warn!(host = %entry, output = %output.combined().trim(), "cannot list sessions");
                continue;
            }
            Err(err) => {
                tracing::warn!(host = %entry, error = %err, "cannot list sessions");
                continue;
            }
        };

        let sessions = output
            .stdout
            .lines()
            .filter_map(|line| line.split_once(':').map(|(name, _)| name.to_string()))
            .filter(|name| name.starts_with(prefix))
            .map(|name| RemoteSession {
                host: host.clone(),
                port,
                name,
            })
            .collect::<Vec<_>>();
        kill_remote_sessions(shell, multiplexer, &sessions).await;
        killed.extend(sessions.into_iter().map(|session| format!("{entry}:{}", session.name)));
    }
    Ok(killed)
}
