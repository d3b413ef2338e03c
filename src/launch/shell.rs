//! The seam through which backends and the supervisor run host commands.
//! Production code goes through [`SystemShell`]; tests substitute a scripted shell.

use super::command::shell_quote;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::process::Stdio;
use tokio::process::Command;

pub type ShellFuture<'a> = BoxFuture<'a, Result<ShellOutput>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, for error matching and logs.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

pub trait RemoteShell: Send + Sync {
    /// Runs `argv` to completion. An `Err` means the command could not be run
    /// at all; a non-zero exit is reported through [`ShellOutput::status`].
    fn run<'a>(&'a self, argv: &'a [String]) -> ShellFuture<'a>;
}

/// Runs commands as local subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell;

impl RemoteShell for SystemShell {
    fn run<'a>(&'a self, argv: &'a [String]) -> ShellFuture<'a> {
        Box::pin(async move {
            let Some((program, args)) = argv.split_first() else {
                bail!("cannot run an empty command");
            };

            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("failed to run {program}"))?;

            Ok(ShellOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Wraps `command` so it runs on `host`. Local hosts without an explicit SSH
/// port skip ssh entirely; otherwise the command is quoted into a single
/// remote shell line.
pub fn remote_argv(host: &str, port: Option<u16>, command: &[String]) -> Vec<String> {
    if is_local_host(host) && port.is_none() {
        return command.to_vec();
    }

    let mut argv = vec!["ssh".to_string()];
    if let Some(port) = port {
        argv.push("-p".to_string());
        argv.push(port.to_string());
    }
    argv.push(host.to_string());
    argv.push(
        command
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" "),
    );
    argv
}
