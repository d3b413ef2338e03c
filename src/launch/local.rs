use super::command::{ensure_executable, worker_commands, LaunchCommand};
use super::shell::SystemShell;
use super::{ensure_not_empty, staging_dir, LaunchError};
use crate::entry::artifact::{artifact_path, stage_program, EntryArtifact};
use crate::entry::registry::{EntryContext, EntryRegistry};
use crate::entry::stopper::{ProgramStopper, LAUNCHER_PID_ENV, LAUNCH_TYPE_ENV, LAUNCH_TYPE_LOCAL};
use crate::program::Program;
use crate::runtime::config::LaunchConfig;
use crate::supervisor::terminate::NoopTerminate;
use crate::supervisor::worker::WorkerRecord;
use crate::supervisor::{SupervisorHandle, SupervisorOptions};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::{Child, Command};

pub const LOCAL_HOST: &str = "localhost";

pub enum LocalMode {
    /// Every node runs the worker binary as a subprocess of this process.
    Processes { config: LaunchConfig, staging: TempDir },
    /// Every node runs as a task on the current runtime.
    Tasks(EntryRegistry),
}

pub struct LocalLauncher {
    mode: LocalMode,
    options: SupervisorOptions,
}

impl LocalLauncher {
    pub fn processes(config: LaunchConfig) -> Result<Self> {
        let staging = staging_dir(&config)?;
        Ok(Self {
            options: SupervisorOptions::from(&config),
            mode: LocalMode::Processes { config, staging },
        })
    }

    pub fn tasks(registry: EntryRegistry, options: SupervisorOptions) -> Self {
        Self {
            mode: LocalMode::Tasks(registry),
            options,
        }
    }

    pub fn mode(&self) -> &LocalMode {
        &self.mode
    }

    pub fn bind(&self, program: &mut Program) -> Result<()> {
        for node in program.nodes_mut() {
            node.set_host(LOCAL_HOST);
            for address in node.addresses() {
                address.bind_loopback()?;
            }
        }
        Ok(())
    }

    pub fn commands(&self, program: &Program) -> Result<Vec<LaunchCommand>> {
        match &self.mode {
            LocalMode::Processes { config, staging } => Ok(worker_commands(
                program,
                config,
                &[
                    (LAUNCH_TYPE_ENV, LAUNCH_TYPE_LOCAL.to_string()),
                    (LAUNCHER_PID_ENV, std::process::id().to_string()),
                ],
                |label| artifact_path(staging.path(), label).display().to_string(),
                |_| LOCAL_HOST.to_string(),
            )),
            LocalMode::Tasks(_) => Ok(program
                .groups()
                .iter()
                .flat_map(|group| {
                    group.nodes().iter().enumerate().map(move |(index, node)| {
                        LaunchCommand::new(
                            vec![node.entry().function.clone()],
                            BTreeMap::new(),
                            format!("{}/{index}", group.label()),
                            LOCAL_HOST,
                            None,
                        )
                    })
                })
                .collect()),
        }
    }

    pub async fn launch(&mut self, program: &mut Program) -> Result<SupervisorHandle> {
        ensure_not_empty(program)?;
        match &self.mode {
            LocalMode::Processes { config, staging } => {
                ensure_executable(config.worker_binary())?;
                let commands = self.commands(program)?;
                stage_program(program, staging.path())?;
                launch_processes(commands, config.launch_dir(), self.options)
            }
            LocalMode::Tasks(registry) => launch_tasks(program, registry, self.options),
        }
    }
}

fn launch_processes(
    commands: Vec<LaunchCommand>,
    launch_dir: &Path,
    options: SupervisorOptions,
) -> Result<SupervisorHandle> {
    let supervisor = SupervisorHandle::spawn(options, Arc::new(SystemShell), Arc::new(NoopTerminate));

    for command in &commands {
        let child = match spawn_command(command, launch_dir) {
            Ok(child) => child,
            Err(err) => {
                // Tear down whatever already started before reporting.
                let _ = supervisor.shutdown();
                let _ = supervisor.seal();
                return Err(err);
            }
        };
        tracing::info!(worker = command.title(), pid = child.id(), "started local worker");
        supervisor.register(WorkerRecord::process(command.title(), child))?;
    }

    supervisor.seal()?;
    Ok(supervisor)
}

fn spawn_command(command: &LaunchCommand, launch_dir: &Path) -> Result<Child> {
    let Some((program, args)) = command.args().split_first() else {
        anyhow::bail!("command for {} is empty", command.title());
    };

    let mut process = Command::new(program);
    process
        .args(args)
        .envs(command.env())
        .current_dir(launch_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);

    process
        .spawn()
        .with_context(|| format!("failed to start worker {}", command.title()))
}

fn launch_tasks(
    program: &Program,
    registry: &EntryRegistry,
    options: SupervisorOptions,
) -> Result<SupervisorHandle> {
    for group in program.groups() {
        for (index, node) in group.nodes().iter().enumerate() {
            let function = &node.entry().function;
            if !registry.contains(function) {
                return Err(LaunchError::UnknownEntry {
                    node: format!("{}/{index}", group.label()),
                    function: function.clone(),
                }
                .into());
            }
        }
    }

    let artifacts = program
        .groups()
        .iter()
        .map(EntryArtifact::from_group)
        .collect::<Result<Vec<_>>>()?;

    let supervisor = SupervisorHandle::spawn(options, Arc::new(SystemShell), Arc::new(NoopTerminate));
    let shutdown = supervisor.task_shutdown();
    for artifact in artifacts {
        for (index, spec) in artifact.entries.into_iter().enumerate() {
            let title = format!("{}/{index}", artifact.group);
            let ctx = EntryContext::new(artifact.group.clone(), index, spec, shutdown.child_token())
                .with_stopper(ProgramStopper::Supervisor(supervisor.clone()));
            let entry = registry.start(ctx)?;
            tracing::debug!(worker = %title, "starting in-process entry");
            supervisor.register(WorkerRecord::task(title, tokio::spawn(entry)))?;
        }
    }

    supervisor.seal()?;
    Ok(supervisor)
}
