use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Counters describing one launch: worker lifecycle on the supervisor side.
#[derive(Default, Debug)]
pub struct Telemetry {
    workers_registered: AtomicU64,
    workers_exited: AtomicU64,
    workers_failed: AtomicU64,
    probe_failures: AtomicU64,
    sessions_opened: AtomicU64,
}

impl Telemetry {
    pub fn record_worker_registered(&self) {
        self.workers_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_exited(&self) {
        self.workers_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_failed(&self) {
        self.workers_failed.fetch_add(1, Ordering::Relaxed);
        self.workers_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            workers_registered: self.workers_registered.load(Ordering::Relaxed),
            workers_exited: self.workers_exited.load(Ordering::Relaxed),
            workers_failed: self.workers_failed.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }

    pub fn active_workers(&self) -> u64 {
        let snapshot = self.snapshot();
        snapshot
            .workers_registered
            .saturating_sub(snapshot.workers_exited)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub workers_registered: u64,
    pub workers_exited: u64,
    pub workers_failed: u64,
    pub probe_failures: u64,
    pub sessions_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_worker_registered();
        telemetry.record_worker_registered();
        telemetry.record_worker_registered();
        telemetry.record_worker_exited();
        telemetry.record_worker_failed();
        telemetry.record_probe_failure();
        telemetry.record_session_opened();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.workers_registered, 3);
        assert_eq!(snapshot.workers_exited, 2);
        assert_eq!(snapshot.workers_failed, 1);
        assert_eq!(snapshot.probe_failures, 1);
        assert_eq!(snapshot.sessions_opened, 1);
        assert_eq!(telemetry.active_workers(), 1);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
