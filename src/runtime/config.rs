use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SESSION_PREFIX: &str = "tlaunch";
const DEFAULT_MULTIPLEXER: &str = "tmux";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_TERMINATION_GRACE_SECS: u64 = 10;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Launcher configuration shared by every backend.
///
/// All instances must be constructed via [`LaunchConfig::builder`] or [`LaunchConfig::new`]
/// so invariants are validated before any backend observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    worker_binary: PathBuf,
    launch_dir: PathBuf,
    staging_dir: Option<PathBuf>,
    session_prefix: String,
    multiplexer: String,
    default_host: String,
    poll_interval: Duration,
    termination_grace: Duration,
    probe_timeout: Duration,
    env: BTreeMap<String, String>,
    group_args: BTreeMap<String, Vec<String>>,
    confirm_on_failure: bool,
}

pub struct LaunchConfigParams {
    pub worker_binary: PathBuf,
    pub launch_dir: PathBuf,
    pub staging_dir: Option<PathBuf>,
    pub session_prefix: String,
    pub multiplexer: String,
    pub default_host: String,
    pub poll_interval: Duration,
    pub termination_grace: Duration,
    pub probe_timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub group_args: BTreeMap<String, Vec<String>>,
    pub confirm_on_failure: bool,
}

impl LaunchConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> LaunchConfigBuilder {
        LaunchConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: LaunchConfigParams) -> Result<Self> {
        let LaunchConfigParams {
            worker_binary,
            launch_dir,
            staging_dir,
            session_prefix,
            multiplexer,
            default_host,
            poll_interval,
            termination_grace,
            probe_timeout,
            env,
            group_args,
            confirm_on_failure,
        } = params;

        let config = Self {
            worker_binary,
            launch_dir,
            staging_dir,
            session_prefix: session_prefix.trim().to_string(),
            multiplexer: multiplexer.trim().to_string(),
            default_host: default_host.trim().to_string(),
            poll_interval,
            termination_grace,
            probe_timeout,
            env,
            group_args,
            confirm_on_failure,
        };

        config.validate()?;
        Ok(config)
    }

    /// Worker executable every launched node runs.
    pub fn worker_binary(&self) -> &PathBuf {
        &self.worker_binary
    }

    /// Working directory for launched processes and remote sessions.
    pub fn launch_dir(&self) -> &PathBuf {
        &self.launch_dir
    }

    /// Parent of the private artifact directory. Point it at a shared
    /// filesystem when remote hosts must read staged artifacts.
    pub fn staging_dir(&self) -> Option<&PathBuf> {
        self.staging_dir.as_ref()
    }

    pub fn session_prefix(&self) -> &str {
        &self.session_prefix
    }

    pub fn multiplexer(&self) -> &str {
        &self.multiplexer
    }

    /// Host used for SSH nodes that did not pin one.
    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// Supervisor polling cadence.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Window between the termination notice and the hard kill.
    pub fn termination_grace(&self) -> Duration {
        self.termination_grace
    }

    /// Upper bound on a single remote liveness probe.
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Environment overrides applied to every launched process.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Extra arguments appended to the commands of one group.
    pub fn group_args(&self, label: &str) -> &[String] {
        self.group_args.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn confirm_on_failure(&self) -> bool {
        self.confirm_on_failure
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_binary.as_os_str().is_empty() {
            bail!("worker_binary must not be empty");
        }

        if self.session_prefix.is_empty() {
            bail!("session_prefix must not be empty");
        }

        if self
            .session_prefix
            .chars()
            .any(|ch| ch.is_whitespace() || ch == ':' || ch == '.')
        {
            bail!("session_prefix must not contain whitespace, ':' or '.'");
        }

        if self.multiplexer.is_empty() {
            bail!("multiplexer must not be empty");
        }

        if self.default_host.is_empty() {
            bail!("default_host must not be empty");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.probe_timeout.is_zero() {
            bail!("probe_timeout must be greater than 0");
        }

        if let Some(key) = self.env.keys().find(|key| !is_env_name(key)) {
            bail!("env key {key:?} must match [A-Za-z_][A-Za-z0-9_]*");
        }

        Ok(())
    }
}

/// Portable shell variable name; keys are written unquoted into shell lines.
fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(ch) if ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[derive(Debug, Default, Clone)]
pub struct LaunchConfigBuilder {
    worker_binary: Option<PathBuf>,
    launch_dir: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    session_prefix: Option<String>,
    multiplexer: Option<String>,
    default_host: Option<String>,
    poll_interval: Option<Duration>,
    termination_grace: Option<Duration>,
    probe_timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    group_args: BTreeMap<String, Vec<String>>,
    confirm_on_failure: Option<bool>,
}

impl LaunchConfigBuilder {
    pub fn worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_binary = Some(path.into());
        self
    }

    pub fn launch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.launch_dir = Some(path.into());
        self
    }

    pub fn staging_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(path.into());
        self
    }

    pub fn session_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_prefix = Some(prefix.into());
        self
    }

    pub fn multiplexer(mut self, binary: impl Into<String>) -> Self {
        self.multiplexer = Some(binary.into());
        self
    }

    pub fn default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = Some(host.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = Some(grace);
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn group_args<I, S>(mut self, label: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_args
            .insert(label.into(), args.into_iter().map(Into::into).collect());
        self
    }

    pub fn confirm_on_failure(mut self, enabled: bool) -> Self {
        self.confirm_on_failure = Some(enabled);
        self
    }

    pub fn build(self) -> Result<LaunchConfig> {
        let launch_dir = match self.launch_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to read current directory")?,
        };

        let params = LaunchConfigParams {
            worker_binary: self.worker_binary.context("worker_binary is required")?,
            launch_dir,
            staging_dir: self.staging_dir,
            session_prefix: self
                .session_prefix
                .unwrap_or_else(|| DEFAULT_SESSION_PREFIX.to_string()),
            multiplexer: self
                .multiplexer
                .unwrap_or_else(|| DEFAULT_MULTIPLEXER.to_string()),
            default_host: self
                .default_host
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)),
            termination_grace: self
                .termination_grace
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_TERMINATION_GRACE_SECS)),
            probe_timeout: self
                .probe_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS)),
            env: self.env,
            group_args: self.group_args,
            confirm_on_failure: self.confirm_on_failure.unwrap_or(false),
        };

        LaunchConfig::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = LaunchConfig::builder()
            .worker_binary("/opt/tlaunch/worker")
            .launch_dir("/srv/job")
            .build()
            .expect("config should build");

        assert_eq!(config.session_prefix(), "tlaunch");
        assert_eq!(config.multiplexer(), "tmux");
        assert_eq!(config.default_host(), "localhost");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.termination_grace(), Duration::from_secs(10));
        assert!(config.staging_dir().is_none());
        assert!(config.group_args("actor").is_empty());
        assert!(!config.confirm_on_failure());
    }

    #[test]
    fn builder_requires_worker_binary() {
        let err = LaunchConfig::builder().build().unwrap_err();
        assert!(format!("{err}").contains("worker_binary"));
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let err = LaunchConfig::builder()
            .worker_binary("/opt/tlaunch/worker")
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("poll_interval"));
    }

    #[test]
    fn validate_rejects_session_prefix_with_separator() {
        let err = LaunchConfig::builder()
            .worker_binary("/opt/tlaunch/worker")
            .session_prefix("job:1")
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("session_prefix"));
    }

    #[test]
    fn validate_rejects_bad_env_key() {
        for key in ["A=B", "", "1ST", "X;rm -rf ~", "A B", "$(id)"] {
            let err = LaunchConfig::builder()
                .worker_binary("/opt/tlaunch/worker")
                .env(key, "1")
                .build()
                .unwrap_err();
            assert!(format!("{err}").contains("env key"), "{key:?} accepted");
        }

        let config = LaunchConfig::builder()
            .worker_binary("/opt/tlaunch/worker")
            .env("_CUDA_VISIBLE_DEVICES2", "0")
            .build()
            .unwrap();
        assert_eq!(config.env()["_CUDA_VISIBLE_DEVICES2"], "0");
    }

    #[test]
    fn group_args_are_kept_per_label() {
        let config = LaunchConfig::builder()
            .worker_binary("/opt/tlaunch/worker")
            .group_args("learner", ["--gpu", "0"])
            .build()
            .unwrap();
        assert_eq!(config.group_args("learner"), ["--gpu", "0"]);
        assert!(config.group_args("actor").is_empty());
    }
}
