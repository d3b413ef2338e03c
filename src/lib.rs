pub mod entry;
pub mod launch;
pub mod program;
pub mod runtime;
pub mod supervisor;
pub mod transmit;

pub use entry::registry::{EntryContext, EntryRegistry};
pub use entry::EntryPoint;
pub use launch::command::LaunchCommand;
pub use launch::kubernetes::{KubernetesConfig, KubernetesLauncher};
pub use launch::local::LocalLauncher;
pub use launch::ssh::SshLauncher;
pub use launch::{LaunchError, LaunchOutcome, Launcher};
pub use program::address::{Address, AddressBuilder, BindingError};
pub use program::handle::{Dereference, Handle};
pub use program::node::Node;
pub use program::{Program, ProgramError};
pub use runtime::config::{LaunchConfig, LaunchConfigBuilder, LaunchConfigParams};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use supervisor::failure::WorkerFailure;
pub use supervisor::{SupervisorHandle, SupervisorOptions};
pub use transmit::{
    RateLimiter, Selector, ServerOptions, TableSpec, TransmitClient, TransmitClientOptions,
    TransmitServer, WeightSnapshot,
};
