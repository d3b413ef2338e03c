use crate::program::{Group, Program};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One node's entry after binding: the function, its arguments, and every
/// endpoint it needs, already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub function: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub handles: BTreeMap<String, String>,
}

/// All entries of one group, in index order. Task index `i` runs `entries[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryArtifact {
    pub group: String,
    pub entries: Vec<EntrySpec>,
}

impl EntryArtifact {
    /// Captures a bound group. Fails if any address or dependency is unbound.
    pub fn from_group(group: &Group) -> Result<Self> {
        let mut entries = Vec::with_capacity(group.len());
        for node in group.nodes() {
            let mut addresses = BTreeMap::new();
            for address in node.addresses() {
                addresses.insert(address.name(), address.resolve()?);
            }

            let mut handles = BTreeMap::new();
            for dependency in node.dependencies() {
                let endpoint = dependency.handle.resolve().with_context(|| {
                    format!(
                        "dependency {} of group {} cannot be resolved",
                        dependency.name,
                        group.label()
                    )
                })?;
                handles.insert(dependency.name.clone(), endpoint);
            }

            entries.push(EntrySpec {
                function: node.entry().function.clone(),
                args: node.entry().args.clone(),
                addresses,
                handles,
            });
        }

        Ok(Self {
            group: group.label().to_string(),
            entries,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .with_context(|| format!("failed to serialize entries of group {}", self.group))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse entry artifact")
    }

    /// Artifact bytes as base64, the form a cluster config map carries.
    pub fn to_base64(&self) -> Result<String> {
        Ok(BASE64_STANDARD.encode(self.to_bytes()?))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read entry artifact {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("in {}", path.display()))
    }

    /// Writes `{group}.json` into `dir` and returns its path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = artifact_path(dir, &self.group);
        std::fs::write(&path, self.to_bytes()?)
            .with_context(|| format!("failed to write entry artifact {}", path.display()))?;
        Ok(path)
    }

    pub fn entry(&self, task_id: usize) -> Result<&EntrySpec> {
        match self.entries.get(task_id) {
            Some(entry) => Ok(entry),
            None => bail!(
                "task id {task_id} is out of range for group {} ({} entries)",
                self.group,
                self.entries.len()
            ),
        }
    }
}

/// Where the artifact of `group` is staged inside `dir`.
pub fn artifact_path(dir: &Path, group: &str) -> PathBuf {
    dir.join(format!("{group}.json"))
}

/// Writes one artifact per group into `dir`, in group order.
pub fn stage_program(program: &Program, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    program
        .groups()
        .iter()
        .map(|group| {
            let artifact = EntryArtifact::from_group(group)?;
            let path = artifact.write(dir)?;
            tracing::debug!(group = group.label(), path = %path.display(), "staged entry artifact");
            Ok((group.label().to_string(), path))
        })
        .collect()
}
