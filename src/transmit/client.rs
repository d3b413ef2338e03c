//! Mailbox client. Every call retries with exponential backoff while the
//! server is unreachable or a table's rate limiter refuses the request, so
//! readers and writers can start in any order.

use super::table::{SampledItem, TableInfo};
use super::weights::WeightSnapshot;
use super::{INFO_TABLE, RATE_LIMITED_CODE};
use crate::program::handle::Dereference;
use crate::runtime::backoff::{retry_with_backoff, Backoff, Retry};
use anyhow::{anyhow, bail, Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;
const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct TransmitClientOptions {
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` keeps retrying until the call succeeds or is cancelled.
    pub max_attempts: Option<usize>,
}

impl Default for TransmitClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            max_attempts: None,
        }
    }
}

impl TransmitClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.initial_backoff.is_zero() {
            bail!("initial_backoff must be greater than 0");
        }
        if self.max_backoff < self.initial_backoff {
            bail!("max_backoff must not be smaller than initial_backoff");
        }
        if self.max_attempts == Some(0) {
            bail!("max_attempts must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TransmitClient {
    endpoint: String,
    client: HttpClient,
    options: TransmitClientOptions,
    cancellation: Option<CancellationToken>,
}

impl Dereference for TransmitClient {
    fn connect(endpoint: &str) -> Result<Self> {
        Self::new(endpoint)
    }
}

impl TransmitClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_options(endpoint, TransmitClientOptions::default())
    }

    /// `endpoint` is `host:port` or a full `http://` URL.
    pub fn with_options(endpoint: impl Into<String>, options: TransmitClientOptions) -> Result<Self> {
        options.validate()?;
        let endpoint = endpoint.into();
        let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.clone()
        } else {
            format!("http://{endpoint}")
        };
        let client = HttpClientBuilder::default()
            .request_timeout(options.request_timeout)
            .build(&url)
            .map_err(|err| anyhow!("failed to build transmit client for {url}: {err}"))?;
        Ok(Self {
            endpoint,
            client,
            options,
            cancellation: None,
        })
    }

    /// Stops pending retries once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Inserts one item into every table named in `priorities` and returns
    /// the per-table keys, in table-name order.
    pub async fn insert(&self, data: &Value, priorities: &BTreeMap<String, f64>) -> Result<Vec<u64>> {
        self.call("insert", || rpc_params![data, priorities]).await
    }

    pub async fn sample(&self, table: &str) -> Result<SampledItem> {
        self.call("sample", || rpc_params![table]).await
    }

    pub async fn tables(&self) -> Result<Vec<TableInfo>> {
        self.call("tables", || rpc_params![]).await
    }

    /// Publishes `value` in the `info` slot, waiting while the previous value
    /// has not been read yet.
    pub async fn send_info<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("failed to serialize info payload")?;
        let payload = Value::String(BASE64_STANDARD.encode(bytes));
        let priorities = BTreeMap::from([(INFO_TABLE.to_string(), 1.0)]);
        self.insert(&payload, &priorities).await?;
        Ok(())
    }

    /// Reads the latest value published with [`send_info`](Self::send_info),
    /// waiting until one is available.
    pub async fn get_info<T: DeserializeOwned>(&self) -> Result<T> {
        let item = self.sample(INFO_TABLE).await?;
        let encoded = item
            .data
            .as_str()
            .ok_or_else(|| anyhow!("info payload is not a base64 string"))?;
        let bytes = BASE64_STANDARD
            .decode(encoded)
            .context("info payload is not valid base64")?;
        serde_json::from_slice(&bytes).context("failed to deserialize info payload")
    }

    pub async fn insert_weight(
        &self,
        snapshot: &WeightSnapshot,
        priorities: &BTreeMap<String, f64>,
    ) -> Result<()> {
        let payload = Value::Array(snapshot.flatten());
        self.insert(&payload, priorities).await?;
        tracing::debug!(version = snapshot.version, tables = ?priorities.keys().collect::<Vec<_>>(), "weights published");
        Ok(())
    }

    /// Samples `table` until it yields a snapshot at `target_version` or
    /// newer, then rebuilds it with the `group@field` key schema `keys`.
    pub async fn sample_weight(
        &self,
        keys: &[String],
        target_version: i64,
        table: &str,
    ) -> Result<WeightSnapshot> {
        loop {
            let item = self.sample(table).await?;
            let values: Vec<Value> = serde_json::from_value(item.data)
                .with_context(|| format!("table {table} does not hold weight payloads"))?;
            let version = WeightSnapshot::payload_version(&values)?;
            if version >= target_version {
                return WeightSnapshot::unflatten(keys, values);
            }
            tracing::debug!(table, version, target_version, "stale weights sampled; waiting");
        }
    }

    fn backoff(&self) -> Backoff<'_> {
        Backoff::new(self.options.initial_backoff, self.options.max_backoff)
            .with_max_attempts(self.options.max_attempts)
            .with_cancellation(self.cancellation.as_ref())
    }

    async fn call<R, P>(&self, method: &'static str, params: P) -> Result<R>
    where
        R: DeserializeOwned + Send,
        P: Fn() -> ArrayParams + Send + Sync,
    {
        retry_with_backoff(
            self.backoff(),
            |_| {
                let params = params();
                async move {
                    self.client
                        .request::<R, _>(method, params)
                        .await
                        .map_err(|err| {
                            anyhow::Error::new(err).context(format!(
                                "transmit {method} call to {} failed",
                                self.endpoint
                            ))
                        })
                }
            },
            classify,
        )
        .await
    }
}

fn classify(err: &anyhow::Error) -> Retry {
    match err.downcast_ref::<JsonRpcError>() {
        Some(JsonRpcError::Call(obj)) if obj.code() == RATE_LIMITED_CODE => Retry::Again,
        Some(JsonRpcError::Transport(_))
        | Some(JsonRpcError::RequestTimeout)
        | Some(JsonRpcError::RestartNeeded(_)) => Retry::Again,
        _ => Retry::GiveUp,
    }
}

/// JSON-RPC error code of a failed call, when the server answered one.
pub fn error_code(err: &anyhow::Error) -> Option<i32> {
    match err.downcast_ref::<JsonRpcError>() {
        Some(JsonRpcError::Call(obj)) => Some(obj.code()),
        _ => None,
    }
}
