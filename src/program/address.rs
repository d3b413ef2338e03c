//! Symbolic endpoints owned by nodes. An address is allocated at graph-build
//! time, bound to a backend strategy at launch time, and only then resolved to
//! a concrete `host:port` string.

use std::fmt;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

/// Port every pod exposes for node traffic on the Kubernetes backend.
pub const KUBERNETES_PORT: u16 = 8001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    NotBound { name: String },
    AlreadyResolved { name: String },
    PortUnavailable { name: String, reason: String },
    NoAddress { node: String },
}

impl fmt::Display for BindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingError::NotBound { name } => {
                write!(f, "address {name} resolved before it was bound by a launcher")
            }
            BindingError::AlreadyResolved { name } => {
                write!(f, "address {name} is already resolved and cannot be rebound")
            }
            BindingError::PortUnavailable { name, reason } => {
                write!(f, "no free port available for address {name}: {reason}")
            }
            BindingError::NoAddress { node } => {
                write!(f, "node {node} has not allocated any address")
            }
        }
    }
}

impl std::error::Error for BindingError {}

/// Backend-specific strategy that turns a bound address into an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressBuilder {
    Loopback {
        port: u16,
    },
    Host {
        host: String,
        port: u16,
    },
    Kubernetes {
        job: String,
        group: String,
        index: usize,
        port: u16,
    },
}

impl AddressBuilder {
    pub fn build(&self) -> String {
        match self {
            AddressBuilder::Loopback { port } => format!("127.0.0.1:{port}"),
            AddressBuilder::Host { host, port } => format!("{host}:{port}"),
            AddressBuilder::Kubernetes {
                job,
                group,
                index,
                port,
            } => format!("{group}-{index}.{job}:{port}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressState {
    Unbound,
    Bound(AddressBuilder),
    Resolved(String),
}

#[derive(Debug)]
struct AddressInner {
    name: String,
    port: Option<u16>,
    state: AddressState,
}

/// Shared handle to a node's endpoint. Clones observe the same binding state,
/// so a handle held by a peer sees the address once the launcher binds it.
#[derive(Debug, Clone)]
pub struct Address {
    inner: Arc<Mutex<AddressInner>>,
}

impl Address {
    pub(crate) fn new(name: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AddressInner {
                name: name.into(),
                port,
                state: AddressState::Unbound,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Fixed port requested at allocation time, if any.
    pub fn fixed_port(&self) -> Option<u16> {
        self.lock().port
    }

    pub fn state(&self) -> AddressState {
        self.lock().state.clone()
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self.lock().state, AddressState::Unbound)
    }

    /// Attaches a builder. Rebinding a bound (but unresolved) address replaces
    /// the strategy; rebinding a resolved one is an error.
    pub fn bind(&self, builder: AddressBuilder) -> Result<(), BindingError> {
        let mut inner = self.lock();
        if let AddressState::Resolved(_) = inner.state {
            return Err(BindingError::AlreadyResolved {
                name: inner.name.clone(),
            });
        }
        inner.state = AddressState::Bound(builder);
        Ok(())
    }

    /// Binds to a loopback port, either the fixed one or a free ephemeral port.
    pub fn bind_loopback(&self) -> Result<(), BindingError> {
        let port = self.port_or_pick()?;
        self.bind(AddressBuilder::Loopback { port })
    }

    /// Binds to `host` using the fixed port or one picked locally.
    pub fn bind_host(&self, host: impl Into<String>) -> Result<(), BindingError> {
        let port = self.port_or_pick()?;
        self.bind(AddressBuilder::Host {
            host: host.into(),
            port,
        })
    }

    /// Returns the concrete endpoint, computing and caching it on first use.
    pub fn resolve(&self) -> Result<String, BindingError> {
        let mut inner = self.lock();
        let endpoint = match &inner.state {
            AddressState::Unbound => {
                return Err(BindingError::NotBound {
                    name: inner.name.clone(),
                })
            }
            AddressState::Resolved(endpoint) => return Ok(endpoint.clone()),
            AddressState::Bound(builder) => builder.build(),
        };
        inner.state = AddressState::Resolved(endpoint.clone());
        Ok(endpoint)
    }

    fn port_or_pick(&self) -> Result<u16, BindingError> {
        let (name, port) = {
            let inner = self.lock();
            (inner.name.clone(), inner.port)
        };
        match port {
            Some(port) => Ok(port),
            None => pick_unused_port().map_err(|err| BindingError::PortUnavailable {
                name,
                reason: err.to_string(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AddressInner> {
        self.inner.lock().expect("address mutex poisoned")
    }
}

/// Asks the OS for a free TCP port on the loopback interface.
///
/// The listener is dropped immediately, so another process may grab the port
/// before the node binds it. Nodes that need a stable port should allocate
/// their address with a fixed one.
pub fn pick_unused_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
