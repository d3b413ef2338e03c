use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use tlaunch::{LaunchConfig, SupervisorHandle};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Writes an executable `/bin/sh` script standing in for the worker binary.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
    path
}

/// Fast-polling configuration with artifacts staged under `staging`.
pub fn fast_config(worker_binary: &Path, staging: &Path) -> LaunchConfig {
    LaunchConfig::builder()
        .worker_binary(worker_binary)
        .launch_dir(staging)
        .staging_dir(staging)
        .session_prefix("itest")
        .poll_interval(Duration::from_millis(20))
        .termination_grace(Duration::from_millis(500))
        .probe_timeout(Duration::from_secs(2))
        .build()
        .expect("valid config")
}

pub async fn wait_for_active(
    supervisor: &SupervisorHandle,
    expected: usize,
    timeout: Duration,
) -> Result<Vec<String>> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = supervisor.status().await?;
        if status.active.len() == expected {
            return Ok(status.active);
        }
        if Instant::now() >= deadline {
            bail!(
                "timed out waiting for {expected} active workers, still have {:?}",
                status.active
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}
