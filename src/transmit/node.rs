//! A ready-made node that serves mailbox tables for the rest of a program.

use super::server::{ServerOptions, TransmitServer};
use super::table::TableSpec;
use crate::entry::registry::{EntryContext, EntryRegistry};
use crate::entry::EntryPoint;
use crate::program::node::Node;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Entry name the worker binary registers for mailbox nodes.
pub const TRANSMIT_ENTRY: &str = "tlaunch.transmit";

/// Address the mailbox server listens on. Handles to the node resolve to it.
pub const TRANSMIT_ADDRESS: &str = "transmit";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitArgs {
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub options: ServerOptions,
}

/// Builds a mailbox node serving `tables` (the `info` table is added by the
/// server).
pub fn transmit_node(tables: Vec<TableSpec>) -> Result<Node> {
    transmit_node_with_options(tables, ServerOptions::default())
}

pub fn transmit_node_with_options(tables: Vec<TableSpec>, options: ServerOptions) -> Result<Node> {
    options.validate()?;
    let entry = EntryPoint::with_args(TRANSMIT_ENTRY, &TransmitArgs { tables, options })?;
    let mut node = Node::new(entry);
    node.allocate_address(TRANSMIT_ADDRESS);
    Ok(node)
}

pub fn register(registry: &mut EntryRegistry) -> &mut EntryRegistry {
    registry.register(TRANSMIT_ENTRY, serve_tables)
}

/// Serves the node's tables until the entry is asked to stop.
pub async fn serve_tables(ctx: EntryContext) -> Result<()> {
    let args: TransmitArgs = ctx.args()?;
    let addr = ctx.listen_addr(TRANSMIT_ADDRESS)?;
    let server = TransmitServer::start(&addr, args.tables, args.options).await?;
    tracing::info!(
        group = ctx.group(),
        task_id = ctx.task_id(),
        endpoint = %server.endpoint(),
        "mailbox node ready"
    );

    ctx.shutdown().cancelled().await;
    server.shutdown().await;
    Ok(())
}
