//! Runtime glue: launch configuration, tracing and counters, retry backoff,
//! and the Ctrl-C aware runner.

pub mod backoff;
pub mod config;
pub mod runner;
pub mod telemetry;
