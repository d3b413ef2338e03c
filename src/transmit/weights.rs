//! Versioned parameter snapshots and their flat wire layout.
//!
//! On the wire a snapshot is a JSON array holding every field value in key
//! order followed by the version. Readers rebuild the nesting from a key
//! schema of `group@field` names that lists the fields in the same order.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const KEY_SEPARATOR: char = '@';

/// Version stamped on snapshots that never had one assigned.
pub const UNVERSIONED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub version: i64,
    pub groups: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Default for WeightSnapshot {
    fn default() -> Self {
        Self::new(UNVERSIONED)
    }
}

impl WeightSnapshot {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            groups: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, group: impl Into<String>, field: impl Into<String>, value: Value) -> &mut Self {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(field.into(), value);
        self
    }

    pub fn get(&self, group: &str, field: &str) -> Option<&Value> {
        self.groups.get(group).and_then(|fields| fields.get(field))
    }

    /// Key schema matching [`flatten`](Self::flatten).
    pub fn keys(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|(group, fields)| {
                fields
                    .keys()
                    .map(move |field| format!("{group}{KEY_SEPARATOR}{field}"))
            })
            .collect()
    }

    pub fn flatten(&self) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .groups
            .values()
            .flat_map(|fields| fields.values().cloned())
            .collect();
        values.push(Value::from(self.version));
        values
    }

    /// Rebuilds a snapshot from `keys` and a flat payload whose last element
    /// is the version.
    pub fn unflatten(keys: &[String], mut values: Vec<Value>) -> Result<Self> {
        let version = values
            .pop()
            .ok_or_else(|| anyhow!("weight payload is empty"))?;
        let version = version
            .as_i64()
            .ok_or_else(|| anyhow!("weight payload version is not an integer: {version}"))?;
        if values.len() < keys.len() {
            bail!(
                "weight payload carries {} values but the key schema names {}",
                values.len(),
                keys.len()
            );
        }

        let mut snapshot = Self::new(version);
        for (key, value) in keys.iter().zip(values) {
            let (group, field) = split_key(key)?;
            snapshot.insert(group, field, value);
        }
        Ok(snapshot)
    }

    /// Version carried by a flat payload, without rebuilding it.
    pub fn payload_version(values: &[Value]) -> Result<i64> {
        values
            .last()
            .and_then(Value::as_i64)
            .context("weight payload does not end with an integer version")
    }
}

/// Splits `group@field`.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once(KEY_SEPARATOR) {
        Some((group, field)) if !group.is_empty() && !field.is_empty() => Ok((group, field)),
        _ => bail!("weight key {key} does not follow the group{KEY_SEPARATOR}field schema"),
    }
}
