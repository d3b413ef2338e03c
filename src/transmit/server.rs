//! JSON-RPC front of the mailbox tables, served with hyper.
//!
//! Methods:
//! * `insert [data, {table: priority, ...}]` returns the item keys,
//! * `sample [table]` returns a [`SampledItem`](super::SampledItem),
//! * `tables []` returns a [`TableInfo`](super::TableInfo) per table.
//!
//! Blocked requests wait up to [`ServerOptions::blocking_wait`] and then fail
//! with [`RATE_LIMITED_CODE`]; clients retry them.

use super::table::{insert_into, Table, TableSpec};
use super::{
    TableError, INFO_TABLE, INVALID_PARAMS_CODE, METHOD_NOT_FOUND_CODE, RATE_LIMITED_CODE,
};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const DEFAULT_BLOCKING_WAIT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    /// How long one request may wait on a rate limiter before it is refused.
    pub blocking_wait: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            blocking_wait: Duration::from_millis(DEFAULT_BLOCKING_WAIT_MS),
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.blocking_wait.is_zero() {
            bail!("blocking_wait must be greater than 0");
        }
        Ok(())
    }
}

/// The served tables, in declaration order with `info` last.
pub(crate) struct TableSet {
    tables: HashMap<String, Arc<Table>>,
    order: Vec<String>,
}

impl TableSet {
    pub(crate) fn build(specs: Vec<TableSpec>) -> Result<Self, TableError> {
        let mut tables = HashMap::new();
        let mut order = Vec::with_capacity(specs.len() + 1);
        for spec in specs {
            if spec.name == INFO_TABLE {
                return Err(TableError::ReservedName { name: spec.name });
            }
            if tables.contains_key(&spec.name) {
                return Err(TableError::DuplicateName { name: spec.name });
            }
            let name = spec.name.clone();
            tables.insert(name.clone(), Arc::new(Table::new(spec)?));
            order.push(name);
        }
        tables.insert(INFO_TABLE.to_string(), Arc::new(Table::new(TableSpec::info())?));
        order.push(INFO_TABLE.to_string());
        Ok(Self { tables, order })
    }

    pub(crate) fn get(&self, name: &str) -> Result<&Arc<Table>, TableError> {
        self.tables
            .get(name)
            .ok_or_else(|| TableError::UnknownTable {
                name: name.to_string(),
            })
    }

    fn names(&self) -> &[String] {
        &self.order
    }
}

pub struct TransmitServer {
    addr: SocketAddr,
    tables: Arc<TableSet>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TransmitServer {
    /// Binds `addr` (use port 0 for an ephemeral port) and starts serving.
    pub async fn start(addr: &str, specs: Vec<TableSpec>, options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let tables = Arc::new(TableSet::build(specs)?);

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind transmit server to {addr}"))?;
        let addr = listener
            .local_addr()
            .context("failed to read transmit server address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert transmit listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set transmit listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let service_tables = tables.clone();
        let make_service = make_service_fn(move |_| {
            let tables = service_tables.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    serve_request(tables.clone(), options, req)
                }))
            }
        });
        let server = Server::from_tcp(std_listener)
            .context("failed to build transmit HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                tracing::error!(error = %err, "transmit server stopped");
            }
        });

        tracing::info!(
            addr = %addr,
            tables = ?tables.names(),
            "transmit server listening"
        );
        Ok(Self {
            addr,
            tables,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` a client can connect to. An unspecified bind address is
    /// reported as loopback.
    pub fn endpoint(&self) -> String {
        if self.addr.ip().is_unspecified() {
            format!("127.0.0.1:{}", self.addr.port())
        } else {
            self.addr.to_string()
        }
    }

    pub fn table_names(&self) -> &[String] {
        self.tables.names()
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).ok().cloned()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        tracing::info!(addr = %self.addr, "transmit server stopped");
    }
}

async fn serve_request(
    tables: Arc<TableSet>,
    options: ServerOptions,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let response_value = match payload {
        Value::Array(calls) => Value::Array(
            join_all(
                calls
                    .into_iter()
                    .map(|call| handle_call(&tables, options, call)),
            )
            .await,
        ),
        call => handle_call(&tables, options, call).await,
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

async fn handle_call(tables: &TableSet, options: ServerOptions, call: Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = call
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));

    let outcome = match method.as_str() {
        "insert" => insert(tables, options, &params).await,
        "sample" => sample(tables, options, &params).await,
        "tables" => Ok(Value::Array(
            join_all(tables.names().iter().filter_map(|name| tables.tables.get(name)).map(|table| table.info()))
                .await
                .into_iter()
                .map(|info| json!(info))
                .collect(),
        )),
        other => Err((METHOD_NOT_FOUND_CODE, format!("Method not found: {other}"))),
    };

    match outcome {
        Ok(result) => success(id, result),
        Err((code, message)) => {
            if code != RATE_LIMITED_CODE {
                tracing::debug!(method = %method, code, message = %message, "transmit request failed");
            }
            error(id, code, &message)
        }
    }
}

type CallResult = std::result::Result<Value, (i32, String)>;

fn table_error(err: TableError) -> (i32, String) {
    (err.code(), err.to_string())
}

fn param<'a>(params: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    match params {
        Value::Array(values) => values.get(index),
        Value::Object(fields) => fields.get(name),
        _ => None,
    }
}

async fn insert(tables: &TableSet, options: ServerOptions, params: &Value) -> CallResult {
    let Some(data) = param(params, 0, "data").cloned() else {
        return Err((INVALID_PARAMS_CODE, "insert requires data".to_string()));
    };
    let priorities: BTreeMap<String, f64> = match param(params, 1, "priorities") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| (INVALID_PARAMS_CODE, format!("invalid priorities: {err}")))?,
        None => return Err((INVALID_PARAMS_CODE, "insert requires priorities".to_string())),
    };
    if priorities.is_empty() {
        return Err((INVALID_PARAMS_CODE, "insert requires at least one table".to_string()));
    }

    // Sorted by name, so concurrent multi-table inserts lock in one order.
    let mut targets = Vec::with_capacity(priorities.len());
    for (name, priority) in &priorities {
        let table = tables.get(name).map_err(table_error)?;
        targets.push((table.clone(), *priority));
    }

    let keys = insert_into(&targets, data, options.blocking_wait)
        .await
        .map_err(table_error)?;
    Ok(json!(keys))
}

async fn sample(tables: &TableSet, options: ServerOptions, params: &Value) -> CallResult {
    let Some(name) = param(params, 0, "table").and_then(Value::as_str) else {
        return Err((INVALID_PARAMS_CODE, "sample requires a table name".to_string()));
    };
    let table = tables.get(name).map_err(table_error)?;
    let item = table
        .sample(options.blocking_wait)
        .await
        .map_err(table_error)?;
    Ok(json!(item))
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message,
        },
        "id": id,
    })
}
