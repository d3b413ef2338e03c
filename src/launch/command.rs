use super::LaunchError;
use crate::program::Program;
use crate::runtime::config::LaunchConfig;
use std::collections::BTreeMap;
use std::path::Path;

/// One process to start, as produced by a backend. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    title: String,
    host: String,
    port: Option<u16>,
}

impl LaunchCommand {
    pub fn new(
        args: Vec<String>,
        env: BTreeMap<String, String>,
        title: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
    ) -> Self {
        Self {
            args,
            env,
            title: title.into(),
            host: host.into(),
            port,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// `{group}/{index}`, used as the window or log title.
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// SSH port of the target host, when not the default.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The command as one POSIX shell line, environment assignments first.
    pub fn shell_line(&self) -> String {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={}", shell_quote(value)))
            .chain(self.args.iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quotes `value` for a POSIX shell. Plain words are left untouched.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./:=@%+,".contains(ch));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Fails unless `path` is an existing file with an execute bit set.
pub fn ensure_executable(path: &Path) -> Result<(), LaunchError> {
    let not_executable = |reason: String| LaunchError::NotExecutable {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|err| not_executable(err.to_string()))?;
    if !metadata.is_file() {
        return Err(not_executable("not a regular file".to_string()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(not_executable("missing execute permission".to_string()));
        }
    }

    Ok(())
}

/// Builds one worker command per node in canonical order. `artifact_for`
/// maps a group label to the artifact path the worker should read, and
/// `host_for` picks the target host of a node. `launch_env` tells the worker
/// how it was launched and wins over configured variables of the same name.
pub(crate) fn worker_commands<A, H>(
    program: &Program,
    config: &LaunchConfig,
    launch_env: &[(&str, String)],
    artifact_for: A,
    host_for: H,
) -> Vec<LaunchCommand>
where
    A: Fn(&str) -> String,
    H: Fn(Option<&str>) -> String,
{
    let binary = config.worker_binary().display().to_string();
    let mut env = config.env().clone();
    env.extend(
        launch_env
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone())),
    );
    let mut commands = Vec::with_capacity(program.len());

    for group in program.groups() {
        let artifact = artifact_for(group.label());
        for (index, node) in group.nodes().iter().enumerate() {
            let mut args = vec![
                binary.clone(),
                "--data-file".to_string(),
                artifact.clone(),
                "--task-id".to_string(),
                index.to_string(),
            ];
            if config.confirm_on_failure() {
                args.push("--confirm-on-failure".to_string());
            }
            args.extend(config.group_args(group.label()).iter().cloned());

            commands.push(LaunchCommand::new(
                args,
                env.clone(),
                format!("{}/{index}", group.label()),
                host_for(node.host()),
                node.ssh_port(),
            ));
        }
    }

    commands
}
