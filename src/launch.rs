//! Launch backends. Each one binds the program's addresses for its
//! environment, produces one [`LaunchCommand`] per node in canonical order,
//! and starts the nodes.

pub mod command;
pub mod kubernetes;
pub mod local;
pub mod shell;
pub mod ssh;

use crate::program::Program;
use crate::runtime::config::LaunchConfig;
use crate::supervisor::SupervisorHandle;
use anyhow::{Context, Result};
use command::LaunchCommand;
use kubernetes::KubernetesLauncher;
use local::LocalLauncher;
use ssh::SshLauncher;
use std::fmt;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    EmptyProgram,
    CrossHostGroup { group: String, hosts: Vec<String> },
    NotExecutable { path: PathBuf, reason: String },
    UnknownEntry { node: String, function: String },
    SessionCreate { host: String, session: String, output: String },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::EmptyProgram => write!(f, "program has no nodes to launch"),
            LaunchError::CrossHostGroup { group, hosts } => write!(
                f,
                "Nodes in the same group must have the same host (group {group} uses {})",
                hosts.join(", ")
            ),
            LaunchError::NotExecutable { path, reason } => {
                write!(f, "{} is not executable: {reason}", path.display())
            }
            LaunchError::UnknownEntry { node, function } => {
                write!(f, "node {node} names unregistered entry {function}")
            }
            LaunchError::SessionCreate {
                host,
                session,
                output,
            } => write!(
                f,
                "failed to create session {session} on {host}: {}",
                output.trim()
            ),
        }
    }
}

impl std::error::Error for LaunchError {}

/// What a launch hands back to the caller.
pub enum LaunchOutcome {
    /// Workers run under this process's supervisor.
    Supervised(SupervisorHandle),
    /// The job was handed to a cluster, which owns its lifecycle from here.
    Submitted { job: String, namespace: String },
}

impl LaunchOutcome {
    pub fn supervisor(&self) -> Option<&SupervisorHandle> {
        match self {
            LaunchOutcome::Supervised(handle) => Some(handle),
            LaunchOutcome::Submitted { .. } => None,
        }
    }

    /// Waits for a supervised job; a submitted job resolves immediately.
    pub async fn wait(&self) -> Result<()> {
        match self {
            LaunchOutcome::Supervised(handle) => handle.wait().await.map_err(Into::into),
            LaunchOutcome::Submitted { job, namespace } => {
                tracing::info!(job = %job, namespace = %namespace, "job is managed by the cluster");
                Ok(())
            }
        }
    }
}

pub enum Launcher {
    Local(LocalLauncher),
    Ssh(SshLauncher),
    Kubernetes(KubernetesLauncher),
}

impl Launcher {
    pub fn name(&self) -> &'static str {
        match self {
            Launcher::Local(_) => "local",
            Launcher::Ssh(_) => "ssh",
            Launcher::Kubernetes(_) => "kubernetes",
        }
    }

    /// Assigns hosts and binds every address of the program.
    pub fn bind(&self, program: &mut Program) -> Result<()> {
        match self {
            Launcher::Local(launcher) => launcher.bind(program),
            Launcher::Ssh(launcher) => launcher.bind(program),
            Launcher::Kubernetes(launcher) => launcher.bind(program),
        }
    }

    /// One command per node of a bound program, in canonical order.
    pub fn commands(&self, program: &Program) -> Result<Vec<LaunchCommand>> {
        match self {
            Launcher::Local(launcher) => launcher.commands(program),
            Launcher::Ssh(launcher) => launcher.commands(program),
            Launcher::Kubernetes(launcher) => launcher.commands(program),
        }
    }

    /// Binds the program unless that already happened, then starts it.
    pub async fn launch(&mut self, program: &mut Program) -> Result<LaunchOutcome> {
        ensure_not_empty(program)?;
        if !is_bound(program) {
            self.bind(program)?;
        }
        tracing::info!(
            backend = self.name(),
            program = program.name(),
            nodes = program.len(),
            "launching program"
        );
        match self {
            Launcher::Local(launcher) => launcher.launch(program).await.map(LaunchOutcome::Supervised),
            Launcher::Ssh(launcher) => launcher.launch(program).await.map(LaunchOutcome::Supervised),
            Launcher::Kubernetes(launcher) => launcher.launch(program).await,
        }
    }
}

impl From<LocalLauncher> for Launcher {
    fn from(launcher: LocalLauncher) -> Self {
        Launcher::Local(launcher)
    }
}

impl From<SshLauncher> for Launcher {
    fn from(launcher: SshLauncher) -> Self {
        Launcher::Ssh(launcher)
    }
}

impl From<KubernetesLauncher> for Launcher {
    fn from(launcher: KubernetesLauncher) -> Self {
        Launcher::Kubernetes(launcher)
    }
}

fn is_bound(program: &Program) -> bool {
    program
        .get_all_nodes()
        .iter()
        .all(|node| node.addresses().iter().all(|address| address.is_bound()))
}

/// Private directory for one launch's artifacts, created inside the shared
/// staging directory when one is configured.
pub(crate) fn staging_dir(config: &LaunchConfig) -> Result<TempDir> {
    let prefix = format!("{}-", config.session_prefix());
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let dir = match config.staging_dir() {
        Some(parent) => builder
            .tempdir_in(parent)
            .with_context(|| format!("failed to create staging directory in {}", parent.display()))?,
        None => builder
            .tempdir()
            .context("failed to create staging directory")?,
    };
    tracing::debug!(path = %dir.path().display(), "created staging directory");
    Ok(dir)
}

pub(crate) fn ensure_not_empty(program: &Program) -> Result<(), LaunchError> {
    if program.is_empty() {
        return Err(LaunchError::EmptyProgram);
    }
    Ok(())
}
