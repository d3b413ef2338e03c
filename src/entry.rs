//! The entry-point contract between the launcher and a worker process.
//!
//! A node names a function registered in the worker binary and carries a JSON
//! argument bundle. After binding, every group's entries are written to one
//! artifact that the worker reads back together with its task index.

pub mod artifact;
pub mod process;
pub mod registry;
pub mod stopper;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub function: String,
    #[serde(default)]
    pub args: Value,
}

impl EntryPoint {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Value::Null,
        }
    }

    pub fn with_args<T: Serialize>(function: impl Into<String>, args: &T) -> Result<Self> {
        let function = function.into();
        let args = serde_json::to_value(args)
            .with_context(|| format!("failed to serialize arguments for entry {function}"))?;
        Ok(Self { function, args })
    }

    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone())
            .with_context(|| format!("invalid arguments for entry {}", self.function))
    }
}
