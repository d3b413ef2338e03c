//! Mailbox tables served over JSON-RPC. Nodes use them to coordinate without
//! assuming anything about peer start order: a writer blocks while a table's
//! rate limiter refuses inserts, a reader blocks until it allows a sample.

pub mod client;
pub mod node;
pub mod rate_limiter;
pub mod server;
pub mod table;
pub mod weights;

pub use client::{TransmitClient, TransmitClientOptions};
pub use rate_limiter::RateLimiter;
pub use server::{ServerOptions, TransmitServer};
pub use table::{SampledItem, Selector, Table, TableInfo, TableSpec};
pub use weights::WeightSnapshot;

use std::fmt;

/// Single-slot table behind `send_info` / `get_info`. Always served.
pub const INFO_TABLE: &str = "info";

/// JSON-RPC error code for a request the rate limiter kept refusing.
pub const RATE_LIMITED_CODE: i32 = -32001;
pub const UNKNOWN_TABLE_CODE: i32 = -32002;
pub const INVALID_PARAMS_CODE: i32 = -32602;
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    UnknownTable { name: String },
    RateLimited { table: String, operation: &'static str },
    ReservedName { name: String },
    DuplicateName { name: String },
    InvalidSpec { name: String, reason: String },
}

impl TableError {
    pub fn code(&self) -> i32 {
        match self {
            TableError::RateLimited { .. } => RATE_LIMITED_CODE,
            TableError::UnknownTable { .. } => UNKNOWN_TABLE_CODE,
            _ => INVALID_PARAMS_CODE,
        }
    }
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::UnknownTable { name } => write!(f, "unknown table {name}"),
            TableError::RateLimited { table, operation } => {
                write!(f, "{operation} on table {table} is rate limited")
            }
            TableError::ReservedName { name } => write!(f, "table name {name} is reserved"),
            TableError::DuplicateName { name } => write!(f, "table {name} is declared twice"),
            TableError::InvalidSpec { name, reason } => write!(f, "table {name} is invalid: {reason}"),
        }
    }
}

impl std::error::Error for TableError {}
