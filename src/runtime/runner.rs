use crate::launch::{LaunchOutcome, Launcher};
use crate::program::Program;
use crate::entry::process::termination_signal;
use anyhow::{anyhow, Result};

/// Launches a program with one backend and turns Ctrl-C or SIGTERM into a
/// coordinated shutdown of everything it started.
pub struct Runner {
    program: Program,
    launcher: Launcher,
    outcome: Option<LaunchOutcome>,
}

impl Runner {
    pub fn new(program: Program, launcher: impl Into<Launcher>) -> Self {
        Self {
            program,
            launcher: launcher.into(),
            outcome: None,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn outcome(&self) -> Option<&LaunchOutcome> {
        self.outcome.as_ref()
    }

    /// Binds and launches the program. Calling it again is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.outcome.is_some() {
            return Ok(());
        }

        let outcome = self.launcher.launch(&mut self.program).await?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Waits for the launched job to finish or fail.
    pub async fn wait(&self) -> Result<()> {
        match &self.outcome {
            Some(outcome) => outcome.wait().await,
            None => Err(anyhow!("program {} has not been launched", self.program.name())),
        }
    }

    /// Runs until the job resolves or a Ctrl-C (SIGINT) asks every worker to
    /// stop. SIGTERM, which local workers send to stop the program, counts
    /// the same.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        let Some(outcome) = self.outcome.as_ref() else {
            return Err(anyhow!("program {} has not been launched", self.program.name()));
        };
        let Some(supervisor) = outcome.supervisor() else {
            return outcome.wait().await;
        };
        tracing::info!(program = self.program.name(), "runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            result = outcome.wait() => return result,
            reason = termination_signal() => {
                tracing::info!(program = self.program.name(), signal = reason, "stop requested; stopping workers");
            }
        }

        supervisor.shutdown()?;
        outcome.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::registry::{EntryContext, EntryRegistry};
    use crate::entry::EntryPoint;
    use crate::launch::local::LocalLauncher;
    use crate::program::node::Node;
    use crate::supervisor::SupervisorOptions;
    use std::time::Duration;

    async fn idle(ctx: EntryContext) -> Result<()> {
        ctx.shutdown().cancelled().await;
        Ok(())
    }

    fn runner() -> Runner {
        let mut registry = EntryRegistry::new();
        registry.register("idle", idle);
        let mut program = Program::new("runner");
        program
            .add_node(Node::new(EntryPoint::new("idle")), Some("idle"))
            .unwrap();
        let options = SupervisorOptions {
            poll_interval: Duration::from_millis(10),
            ..SupervisorOptions::default()
        };
        Runner::new(program, LocalLauncher::tasks(registry, options))
    }

    #[tokio::test]
    async fn wait_before_start_fails() {
        let runner = runner();
        assert!(runner.wait().await.is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_resolves_the_job() {
        let mut runner = runner();
        runner.start().await.unwrap();
        runner.start().await.unwrap();

        let supervisor = runner.outcome().and_then(LaunchOutcome::supervisor).unwrap();
        supervisor.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(10), runner.wait())
            .await
            .expect("job did not resolve")
            .unwrap();
    }
}
