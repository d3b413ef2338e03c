use super::address::Address;
use super::handle::Handle;
use crate::entry::EntryPoint;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a node value. Clones share it, which is how a
/// program notices the same node being added twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

/// Position of a node inside its program: group label plus index within the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub label: String,
    pub index: usize,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.label, self.index)
    }
}

/// A dependency edge: the name under which the entry looks the peer up, and
/// the handle pointing at it.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub handle: Handle,
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    entry: EntryPoint,
    host: Option<String>,
    ssh_port: Option<u16>,
    addresses: Vec<Address>,
    dependencies: Vec<Dependency>,
    identity: Option<NodeIdentity>,
}

impl Node {
    pub fn new(entry: EntryPoint) -> Self {
        Self {
            id: NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)),
            entry,
            host: None,
            ssh_port: None,
            addresses: Vec::new(),
            dependencies: Vec::new(),
            identity: None,
        }
    }

    /// Pins the node to a host, written either as `host` or `host:ssh_port`.
    pub fn on_host(mut self, host: &str) -> Result<Self> {
        let (name, port) = parse_host(host)?;
        self.host = Some(name);
        self.ssh_port = port;
        Ok(self)
    }

    /// Allocates a named endpoint whose port is picked when the launcher binds it.
    pub fn allocate_address(&mut self, name: impl Into<String>) -> Address {
        let address = Address::new(name, None);
        self.addresses.push(address.clone());
        address
    }

    /// Allocates a named endpoint that always uses `port`.
    pub fn allocate_address_with_port(&mut self, name: impl Into<String>, port: u16) -> Address {
        let address = Address::new(name, Some(port));
        self.addresses.push(address.clone());
        address
    }

    /// Records that this node talks to the node behind `handle`. The entry sees
    /// the peer's endpoint under `name`.
    pub fn depends_on(&mut self, name: impl Into<String>, handle: &Handle) {
        self.dependencies.push(Dependency {
            name: name.into(),
            handle: handle.clone(),
        });
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh_port
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Assigned by [`crate::Program::add_node`]; `None` for a node not yet in a program.
    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.as_ref()
    }

    pub(crate) fn set_identity(&mut self, identity: NodeIdentity) {
        self.identity = Some(identity);
    }

    pub(crate) fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    pub(crate) fn set_ssh_port(&mut self, port: Option<u16>) {
        self.ssh_port = port;
    }
}

/// Parses `host`, `host:port`, `[ipv6]` or `[ipv6]:port`. A bare address
/// with several colons is ambiguous and rejected.
pub(crate) fn parse_host(value: &str) -> Result<(String, Option<u16>)> {
    let value = value.trim();
    if value.is_empty() {
        bail!("host must not be empty");
    }

    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated '[' in host {value}"))?;
        if host.is_empty() {
            bail!("host must not be empty in {value}");
        }
        return match tail {
            "" => Ok((host.to_string(), None)),
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .with_context(|| format!("unexpected text after ']' in host {value}"))?;
                Ok((host.to_string(), Some(parse_port(port, value)?)))
            }
        };
    }

    match value.split_once(':') {
        Some((_, rest)) if rest.contains(':') => {
            bail!("host {value} looks like an IPv6 address; write it as [addr] or [addr]:port")
        }
        Some((host, port)) => {
            if host.is_empty() {
                bail!("host must not be empty in {value}");
            }
            Ok((host.to_string(), Some(parse_port(port, value)?)))
        }
        None => Ok((value.to_string(), None)),
    }
}

fn parse_port(port: &str, value: &str) -> Result<u16> {
    port.parse::<u16>()
        .with_context(|| format!("invalid ssh port in host {value}"))
}
