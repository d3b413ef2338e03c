use super::artifact::EntrySpec;
use super::stopper::ProgramStopper;
use crate::program::handle::Dereference;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type EntryFuture = BoxFuture<'static, Result<()>>;

type EntryFn = Arc<dyn Fn(EntryContext) -> EntryFuture + Send + Sync>;

/// Everything a running entry knows about itself and its peers.
#[derive(Debug, Clone)]
pub struct EntryContext {
    group: String,
    task_id: usize,
    spec: EntrySpec,
    shutdown: CancellationToken,
    stopper: ProgramStopper,
}

impl EntryContext {
    pub fn new(
        group: impl Into<String>,
        task_id: usize,
        spec: EntrySpec,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            group: group.into(),
            task_id,
            spec,
            shutdown,
            stopper: ProgramStopper::Unavailable,
        }
    }

    pub fn with_stopper(mut self, stopper: ProgramStopper) -> Self {
        self.stopper = stopper;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn task_id(&self) -> usize {
        self.task_id
    }

    pub fn function(&self) -> &str {
        &self.spec.function
    }

    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.spec.args.clone())
            .with_context(|| format!("invalid arguments for entry {}", self.spec.function))
    }

    /// Resolved endpoint of one of the node's own addresses.
    pub fn address(&self, name: &str) -> Result<&str> {
        self.spec
            .addresses
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("entry {} has no address named {name}", self.spec.function))
    }

    /// Socket address to listen on for one of the node's own addresses. Keeps
    /// the port and listens on every interface.
    pub fn listen_addr(&self, name: &str) -> Result<String> {
        let endpoint = self.address(name)?;
        let (_, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("address {name} has no port: {endpoint}"))?;
        Ok(format!("0.0.0.0:{port}"))
    }

    /// Resolved endpoint of a dependency.
    pub fn handle(&self, name: &str) -> Result<&str> {
        self.spec
            .handles
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("entry {} has no handle named {name}", self.spec.function))
    }

    pub fn connect<C: Dereference>(&self, name: &str) -> Result<C> {
        let endpoint = self.handle(name)?;
        C::connect(endpoint).with_context(|| format!("failed to connect to {name} at {endpoint}"))
    }

    /// Cancelled when the launcher asks the entry to stop.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stops every node of the program this entry belongs to.
    pub async fn stop_program(&self) -> Result<()> {
        self.stopper
            .stop_program()
            .await
            .with_context(|| format!("entry {} could not stop the program", self.spec.function))
    }

    pub fn stopper(&self) -> &ProgramStopper {
        &self.stopper
    }
}

/// Named entry functions compiled into a worker binary.
#[derive(Clone, Default)]
pub struct EntryRegistry {
    entries: HashMap<String, EntryFn>,
}

impl fmt::Debug for EntryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("EntryRegistry").field("entries", &names).finish()
    }
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, entry: F) -> &mut Self
    where
        F: Fn(EntryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let entry: EntryFn = Arc::new(move |ctx| entry(ctx).boxed());
        self.entries.insert(name.into(), entry);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Builds the future for the entry named in `ctx`.
    pub fn start(&self, ctx: EntryContext) -> Result<EntryFuture> {
        let entry = self
            .entries
            .get(ctx.function())
            .ok_or_else(|| anyhow!("no entry registered under {}", ctx.function()))?;
        Ok(entry(ctx))
    }
}
