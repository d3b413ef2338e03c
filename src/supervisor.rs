//! Worker liveness supervision.
//!
//! One background task owns the registry of active workers. Launchers talk to
//! it through a [`SupervisorHandle`]: they register workers while launching,
//! seal the registry once every worker is known, and then wait. Each tick the
//! task probes every worker; the first failure starts a coordinated shutdown,
//! and the job resolves once the registry is sealed and empty.

pub mod failure;
pub mod terminate;
pub mod worker;

use crate::launch::shell::RemoteShell;
use crate::runtime::config::LaunchConfig;
use crate::runtime::telemetry::{Telemetry, TelemetrySnapshot};
use anyhow::{anyhow, Result};
use failure::{FailureLatch, WorkerFailure};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use terminate::Terminate;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use worker::{Liveness, WorkerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub poll_interval: Duration,
    pub termination_grace: Duration,
    pub probe_timeout: Duration,
}

impl From<&LaunchConfig> for SupervisorOptions {
    fn from(config: &LaunchConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            termination_grace: config.termination_grace(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            termination_grace: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub active: Vec<String>,
    pub sealed: bool,
    pub stopping: bool,
    pub failure: Option<WorkerFailure>,
}

pub type JobOutcome = std::result::Result<(), WorkerFailure>;

enum Command {
    Register(WorkerRecord),
    Seal,
    Status(oneshot::Sender<SupervisorStatus>),
    Shutdown,
}

#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    outcome: watch::Receiver<Option<JobOutcome>>,
    latch: Arc<FailureLatch>,
    telemetry: Arc<Telemetry>,
    task_shutdown: CancellationToken,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle").finish_non_exhaustive()
    }
}

impl SupervisorHandle {
    /// Starts the supervision loop on the current runtime.
    pub fn spawn(
        options: SupervisorOptions,
        shell: Arc<dyn RemoteShell>,
        terminator: Arc<dyn Terminate>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let latch = Arc::new(FailureLatch::default());
        let telemetry = Arc::new(Telemetry::default());
        let task_shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            options,
            shell,
            terminator,
            commands: commands_rx,
            commands_open: true,
            outcome: outcome_tx,
            latch: latch.clone(),
            telemetry: telemetry.clone(),
            task_shutdown: task_shutdown.clone(),
            workers: Vec::new(),
            sealed: false,
            kill_deadline: None,
        };
        let _task: JoinHandle<()> = tokio::spawn(supervisor.run());

        Self {
            commands: commands_tx,
            outcome: outcome_rx,
            latch,
            telemetry,
            task_shutdown,
        }
    }

    pub fn register(&self, worker: WorkerRecord) -> Result<()> {
        self.send(Command::Register(worker))
    }

    /// Marks launching as complete. The job cannot resolve before this.
    pub fn seal(&self) -> Result<()> {
        self.send(Command::Seal)
    }

    /// Starts the coordinated shutdown without recording a failure.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub async fn status(&self) -> Result<SupervisorStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await
            .map_err(|_| anyhow!("supervisor stopped before answering"))
    }

    /// Blocks until every worker is gone. Resolves to the first failure, if any.
    pub async fn wait(&self) -> JobOutcome {
        let mut outcome = self.outcome.clone();
        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        let resolved = resolved.or_else(|| outcome.borrow().clone());
        resolved.unwrap_or_else(|| {
            Err(WorkerFailure::new(
                "supervisor",
                anyhow!("supervisor stopped without resolving the job"),
            ))
        })
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn failure(&self) -> Option<WorkerFailure> {
        self.latch.first()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub(crate) fn record_session_opened(&self) {
        self.telemetry.record_session_opened();
    }

    /// Token cancelled when shutdown begins. In-process entries derive their
    /// own shutdown token from it.
    pub fn task_shutdown(&self) -> CancellationToken {
        self.task_shutdown.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("supervisor is no longer running"))
    }
}

struct Supervisor {
    options: SupervisorOptions,
    shell: Arc<dyn RemoteShell>,
    terminator: Arc<dyn Terminate>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    outcome: watch::Sender<Option<JobOutcome>>,
    latch: Arc<FailureLatch>,
    telemetry: Arc<Telemetry>,
    task_shutdown: CancellationToken,
    workers: Vec<WorkerRecord>,
    sealed: bool,
    kill_deadline: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut ticker = time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !(self.sealed && self.workers.is_empty()) {
            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        // Every handle is gone; nothing more can be registered.
                        self.commands_open = false;
                        self.sealed = true;
                    }
                },
                _ = ticker.tick() => self.poll().await,
            }
        }

        let outcome = match self.latch.first() {
            Some(failure) => Err(failure),
            None => Ok(()),
        };
        let snapshot = self.telemetry.snapshot();
        tracing::info!(
            failed = outcome.is_err(),
            registered = snapshot.workers_registered,
            exited = snapshot.workers_exited,
            worker_failures = snapshot.workers_failed,
            probe_failures = snapshot.probe_failures,
            "all workers finished; supervisor stopping"
        );
        self.task_shutdown.cancel();
        let _ = self.outcome.send(Some(outcome));
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register(worker) => {
                tracing::debug!(worker = worker.label(), "worker registered");
                self.telemetry.record_worker_registered();
                if self.latch.is_stopping() {
                    worker.notify_termination();
                }
                self.workers.push(worker);
            }
            Command::Seal => {
                tracing::debug!(workers = self.workers.len(), "worker registry sealed");
                self.sealed = true;
            }
            Command::Status(reply) => {
                let _ = reply.send(SupervisorStatus {
                    active: self
                        .workers
                        .iter()
                        .map(|worker| worker.label().to_string())
                        .collect(),
                    sealed: self.sealed,
                    stopping: self.latch.is_stopping(),
                    failure: self.latch.first(),
                });
            }
            Command::Shutdown => self.begin_shutdown("shutdown requested").await,
        }
    }

    async fn poll(&mut self) {
        let shell = self.shell.clone();
        let probe_timeout = self.options.probe_timeout;
        let checks = join_all(
            self.workers
                .iter_mut()
                .map(|worker| worker.check(shell.as_ref(), probe_timeout)),
        )
        .await;

        let mut any_dead = false;
        let mut stopped_by: Option<String> = None;
        let mut survivors = Vec::with_capacity(self.workers.len());
        for (worker, liveness) in std::mem::take(&mut self.workers).into_iter().zip(checks) {
            match liveness {
                Liveness::Alive => survivors.push(worker),
                Liveness::Exited => {
                    any_dead = true;
                    self.telemetry.record_worker_exited();
                    tracing::info!(worker = worker.label(), "worker exited");
                }
                Liveness::Failed(err) => {
                    any_dead = true;
                    self.telemetry.record_worker_failed();
                    self.latch
                        .record(WorkerFailure::new(worker.label(), err));
                }
                Liveness::Lost(reason) => {
                    any_dead = true;
                    self.telemetry.record_probe_failure();
                    self.telemetry.record_worker_exited();
                    tracing::warn!(worker = worker.label(), reason = %reason, "worker presumed dead");
                }
                Liveness::Stopped(report) => {
                    any_dead = true;
                    let recorded = match report.failure {
                        Some(reason) => self
                            .latch
                            .record(WorkerFailure::new(report.worker.clone(), anyhow!(reason))),
                        None => false,
                    };
                    if recorded {
                        self.telemetry.record_worker_failed();
                    } else {
                        self.telemetry.record_worker_exited();
                    }
                    tracing::info!(worker = worker.label(), stopped_by = %report.worker, "worker gone after a program stop");
                    stopped_by.get_or_insert(report.worker);
                }
            }
        }
        self.workers = survivors;
        if any_dead {
            tracing::debug!(active = self.telemetry.active_workers(), "workers left the registry");
        }

        if let Some(node) = stopped_by {
            if !self.latch.is_stopping() {
                self.begin_shutdown(&format!("program stopped by {node}")).await;
            }
        }

        if any_dead && self.latch.first().is_some() && !self.latch.is_stopping() {
            self.begin_shutdown("worker failure").await;
        }

        if let Some(deadline) = self.kill_deadline {
            if Instant::now() >= deadline && !self.workers.is_empty() {
                tracing::warn!(
                    workers = self.workers.len(),
                    "termination grace period elapsed; killing remaining workers"
                );
                for worker in &mut self.workers {
                    worker.force_stop();
                }
                self.kill_deadline = None;
            }
        }
    }

    async fn begin_shutdown(&mut self, reason: &str) {
        if !self.latch.begin_stopping() {
            return;
        }

        tracing::warn!(reason, workers = self.workers.len(), "terminating job");
        for worker in &self.workers {
            worker.notify_termination();
        }
        self.task_shutdown.cancel();
        self.terminator.terminate().await;
        self.kill_deadline = Some(Instant::now() + self.options.termination_grace);
    }
}
