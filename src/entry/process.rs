//! Worker-process side of the entry contract: locate the artifact, run the
//! entry at the task index, and turn termination signals into cancellation.

use super::artifact::EntryArtifact;
use super::registry::{EntryContext, EntryRegistry};
use super::stopper::ProgramStopper;
use crate::runtime::telemetry::init_tracing;
use crate::supervisor::worker::panic_message;
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/config";

#[derive(Debug, Clone, Parser)]
#[command(name = "tlaunch-worker", about = "Runs one node of a launched program")]
pub struct WorkerArgs {
    /// Entry artifact written by the launcher.
    #[arg(long)]
    pub data_file: Option<PathBuf>,
    /// Index of the entry to run inside the artifact.
    #[arg(long)]
    pub task_id: Option<usize>,
    /// Directory holding one artifact per role, used when no data file is given.
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,
    /// Ask the operator before letting a failure stop the whole job.
    #[arg(long, default_value_t = false)]
    pub confirm_on_failure: bool,
}

impl WorkerArgs {
    /// Artifact path and task index. Without `--data-file` the pod hostname
    /// `{role}-{index}` selects `{config_dir}/{role}`.
    pub fn locate(&self) -> Result<(PathBuf, usize)> {
        match (&self.data_file, self.task_id) {
            (Some(path), Some(task_id)) => Ok((path.clone(), task_id)),
            (Some(_), None) => bail!("--task-id is required with --data-file"),
            (None, _) => {
                let hostname = current_hostname()?;
                let (role, task_id) = parse_pod_hostname(&hostname)?;
                Ok((self.config_dir.join(role), task_id))
            }
        }
    }
}

/// Splits a pod hostname such as `actor-3` into its role and index.
pub fn parse_pod_hostname(hostname: &str) -> Result<(&str, usize)> {
    let (role, index) = hostname
        .trim()
        .rsplit_once('-')
        .ok_or_else(|| anyhow!("hostname {hostname} does not follow the role-index pattern"))?;
    if role.is_empty() {
        bail!("hostname {hostname} has an empty role");
    }
    let index = index
        .parse::<usize>()
        .with_context(|| format!("hostname {hostname} has a non-numeric task index"))?;
    Ok((role, index))
}

fn current_hostname() -> Result<String> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.trim().is_empty() {
            return Ok(hostname.trim().to_string());
        }
    }
    let hostname = std::fs::read_to_string("/etc/hostname")
        .context("failed to determine hostname: HOSTNAME is unset and /etc/hostname unreadable")?;
    Ok(hostname.trim().to_string())
}

/// Runs one entry of the artifact at `path` until it finishes or the process
/// is asked to stop.
pub async fn run_entry(registry: &EntryRegistry, path: &Path, task_id: usize) -> Result<()> {
    let artifact = EntryArtifact::read(path)?;
    let stopper = ProgramStopper::from_env(path, &worker_title(&artifact.group, task_id));
    run_artifact(registry, artifact, task_id, stopper).await
}

fn worker_title(group: &str, task_id: usize) -> String {
    format!("{group}/{task_id}")
}

async fn run_artifact(
    registry: &EntryRegistry,
    artifact: EntryArtifact,
    task_id: usize,
    stopper: ProgramStopper,
) -> Result<()> {
    let spec = artifact.entry(task_id)?.clone();
    let shutdown = CancellationToken::new();
    let ctx = EntryContext::new(artifact.group.clone(), task_id, spec, shutdown.clone())
        .with_stopper(stopper);
    let function = ctx.function().to_string();
    let entry = registry.start(ctx)?;

    tracing::info!(group = %artifact.group, task_id, function = %function, "starting entry");

    let mut task = tokio::spawn(AssertUnwindSafe(entry).catch_unwind());
    let outcome = tokio::select! {
        joined = &mut task => joined,
        reason = termination_signal() => {
            tracing::info!(signal = reason, function = %function, "termination requested; cancelling entry");
            shutdown.cancel();
            task.await
        }
    };

    match outcome {
        Ok(Ok(result)) => result.with_context(|| format!("entry {function} failed")),
        Ok(Err(panic)) => Err(anyhow!(
            "entry {function} panicked: {}",
            panic_message(panic.as_ref())
        )),
        Err(err) => Err(anyhow!("entry {function} task was aborted: {err}")),
    }
}

/// Resolves on SIGTERM or Ctrl-C with the name of the signal.
#[cfg(unix)]
pub(crate) async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    match unix_signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = signal::ctrl_c() => "SIGINT",
        },
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn termination_signal() -> &'static str {
    let _ = signal::ctrl_c().await;
    "SIGINT"
}

/// Process entry for worker binaries: parses the command line, runs the
/// entry on a fresh runtime, and maps the outcome to an exit code. A failure
/// stops the whole program unless the operator declines when asked.
pub fn worker_main(registry: EntryRegistry) -> ExitCode {
    init_tracing();
    let args = WorkerArgs::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let prepared = args.locate().and_then(|(path, task_id)| {
            let artifact = EntryArtifact::read(&path)?;
            let stopper = ProgramStopper::from_env(&path, &worker_title(&artifact.group, task_id));
            Ok((artifact, task_id, stopper))
        });
        let (artifact, task_id, stopper) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::error!(error = ?err, "worker could not load its entry");
                return ExitCode::FAILURE;
            }
        };

        let err = match run_artifact(&registry, artifact, task_id, stopper.clone()).await {
            Ok(()) => return ExitCode::SUCCESS,
            Err(err) => err,
        };
        tracing::error!(error = ?err, "worker failed");

        if args.confirm_on_failure {
            let input = BufReader::new(tokio::io::stdin());
            let mut output = tokio::io::stdout();
            if !confirm_stop(input, &mut output).await {
                tracing::warn!("operator kept the job running; exiting cleanly");
                return ExitCode::SUCCESS;
            }
        }
        if let Err(stop_err) = stopper.stop_after_failure(&err).await {
            tracing::warn!(error = ?stop_err, "failed to stop the program after the failure");
        }
        ExitCode::FAILURE
    })
}

/// Asks whether the failure should stop the whole job. Anything other than a
/// clear "no" stops it, including a closed input.
async fn confirm_stop<R, W>(input: R, output: &mut W) -> bool
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let prompt = b"Node failed. Stop the whole job? (yes/no) ";
    if output.write_all(prompt).await.is_err() || output.flush().await.is_err() {
        return true;
    }

    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(answer)) => match answer.trim().to_ascii_lowercase().as_str() {
                "yes" | "y" => return true,
                "no" | "n" => return false,
                _ => {
                    let _ = output.write_all(b"Please answer yes or no: ").await;
                    let _ = output.flush().await;
                }
            },
            // No operator attached; let the failure propagate.
            Ok(None) | Err(_) => return true,
        }
    }
}
