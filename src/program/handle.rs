use super::address::{Address, BindingError};
use super::node::NodeIdentity;
use anyhow::{Context, Result};

/// Client types that can be built from a resolved endpoint.
pub trait Dereference: Sized {
    fn connect(endpoint: &str) -> Result<Self>;
}

/// Forward reference to a node, handed out by `add_node` before anything runs.
///
/// The handle follows the target's first allocated address. It resolves only
/// after a launcher has bound that address.
#[derive(Debug, Clone)]
pub struct Handle {
    target: NodeIdentity,
    address: Option<Address>,
}

impl Handle {
    pub(crate) fn new(target: NodeIdentity, address: Option<Address>) -> Self {
        Self { target, address }
    }

    pub fn target(&self) -> &NodeIdentity {
        &self.target
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn resolve(&self) -> Result<String, BindingError> {
        match &self.address {
            Some(address) => address.resolve(),
            None => Err(BindingError::NoAddress {
                node: self.target.to_string(),
            }),
        }
    }

    /// Builds a live client for the target node.
    pub fn dereference<C: Dereference>(&self) -> Result<C> {
        let endpoint = self.resolve()?;
        C::connect(&endpoint)
            .with_context(|| format!("failed to connect to node {} at {endpoint}", self.target))
    }
}
