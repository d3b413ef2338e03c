use super::rate_limiter::RateLimiter;
use super::{TableError, INFO_TABLE};
use futures::future::select_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::{timeout_at, Instant};

/// Which stored item an operation picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    /// Oldest item.
    Fifo,
    /// Most recently inserted item.
    Lifo,
    Uniform,
}

impl Selector {
    fn pick(self, len: usize) -> usize {
        match self {
            Selector::Fifo => 0,
            Selector::Lifo => len - 1,
            Selector::Uniform => rand::rng().random_range(0..len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub sampler: Selector,
    pub remover: Selector,
    pub max_size: usize,
    /// Items are dropped after this many samples. Zero keeps them forever.
    #[serde(default)]
    pub max_times_sampled: u32,
    pub rate_limiter: RateLimiter,
}

impl TableSpec {
    pub fn new(
        name: impl Into<String>,
        sampler: Selector,
        remover: Selector,
        max_size: usize,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            name: name.into(),
            sampler,
            remover,
            max_size,
            max_times_sampled: 0,
            rate_limiter,
        }
    }

    pub fn with_max_times_sampled(mut self, max_times_sampled: u32) -> Self {
        self.max_times_sampled = max_times_sampled;
        self
    }

    /// The mailbox slot: one item, each insert delivered to one sample, a
    /// newer insert replacing the previous item.
    pub fn info() -> Self {
        Self::new(INFO_TABLE, Selector::Uniform, Selector::Fifo, 1, RateLimiter::queue(1))
    }

    /// Tables for lock-step exchange with `actors` peers: `sync_signal` and
    /// `id` queues sized to the peer count, plus one single-slot `weight_N`
    /// and `replay_buffer_N` table per peer.
    pub fn sync_tables(actors: usize) -> Vec<Self> {
        let mut tables = vec![
            Self::new("sync_signal", Selector::Uniform, Selector::Fifo, actors, RateLimiter::queue(actors))
                .with_max_times_sampled(1),
            Self::new("id", Selector::Uniform, Selector::Fifo, actors, RateLimiter::queue(actors))
                .with_max_times_sampled(1),
        ];
        for index in 0..actors {
            tables.push(Self::new(
                format!("weight_{index}"),
                Selector::Uniform,
                Selector::Fifo,
                1,
                RateLimiter::queue(1),
            ));
            tables.push(Self::new(
                format!("replay_buffer_{index}"),
                Selector::Uniform,
                Selector::Fifo,
                1,
                RateLimiter::queue(1),
            ));
        }
        tables
    }

    pub fn validate(&self) -> Result<(), TableError> {
        let invalid = |reason: String| TableError::InvalidSpec {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.max_size == 0 {
            return Err(invalid("max_size must be greater than 0".to_string()));
        }
        self.rate_limiter.validate().map_err(invalid)
    }
}

/// An item handed out by a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledItem {
    pub table: String,
    pub key: u64,
    pub data: Value,
    pub priority: f64,
    pub times_sampled: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub size: usize,
    pub max_size: usize,
    pub inserts: u64,
    pub samples: u64,
    pub evictions: u64,
}

struct StoredItem {
    key: u64,
    data: Value,
    priority: f64,
    times_sampled: u32,
}

#[derive(Default)]
pub(crate) struct TableState {
    items: VecDeque<StoredItem>,
    inserts: u64,
    samples: u64,
    evictions: u64,
    next_key: u64,
}

/// An async table guarded by its rate limiter. Blocked callers wait on a
/// `Notify` that every successful insert or sample fires.
pub struct Table {
    spec: TableSpec,
    state: Mutex<TableState>,
    notify: Notify,
}

impl Table {
    pub fn new(spec: TableSpec) -> Result<Self, TableError> {
        spec.validate()?;
        Ok(Self {
            spec,
            state: Mutex::new(TableState::default()),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub async fn info(&self) -> TableInfo {
        let state = self.state.lock().await;
        TableInfo {
            name: self.spec.name.clone(),
            size: state.items.len(),
            max_size: self.spec.max_size,
            inserts: state.inserts,
            samples: state.samples,
            evictions: state.evictions,
        }
    }

    /// Inserts `data`, waiting up to `wait` for the rate limiter.
    pub async fn insert(self: &Arc<Self>, data: Value, priority: f64, wait: Duration) -> Result<u64, TableError> {
        let keys = insert_into(&[(self.clone(), priority)], data, wait).await?;
        Ok(keys[0])
    }

    /// Samples one item, waiting up to `wait` for the rate limiter.
    pub async fn sample(&self, wait: Duration) -> Result<SampledItem, TableError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_sample().await {
                return Ok(item);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(TableError::RateLimited {
                    table: self.spec.name.clone(),
                    operation: "sample",
                });
            }
        }
    }

    pub async fn try_sample(&self) -> Option<SampledItem> {
        let mut state = self.state.lock().await;
        let limiter = &self.spec.rate_limiter;
        if state.items.is_empty() || !limiter.can_sample(state.items.len(), state.inserts, state.samples) {
            return None;
        }

        let position = self.spec.sampler.pick(state.items.len());
        state.samples += 1;
        let item = &mut state.items[position];
        item.times_sampled += 1;
        let sampled = SampledItem {
            table: self.spec.name.clone(),
            key: item.key,
            data: item.data.clone(),
            priority: item.priority,
            times_sampled: item.times_sampled,
        };
        if self.spec.max_times_sampled > 0 && item.times_sampled >= self.spec.max_times_sampled {
            state.items.remove(position);
        }
        drop(state);

        self.notify.notify_waiters();
        Some(sampled)
    }

    fn can_insert(&self, state: &TableState) -> bool {
        self.spec.rate_limiter.can_insert(state.inserts, state.samples)
    }

    fn push(&self, state: &mut TableState, data: Value, priority: f64) -> u64 {
        let key = state.next_key;
        state.next_key += 1;
        state.inserts += 1;
        state.items.push_back(StoredItem {
            key,
            data,
            priority,
            times_sampled: 0,
        });
        while state.items.len() > self.spec.max_size {
            let position = self.spec.remover.pick(state.items.len());
            state.items.remove(position);
            state.evictions += 1;
        }
        key
    }
}

/// Inserts one item into every listed table at once: it waits until each
/// limiter admits the insert, so no table receives the item alone. Tables
/// are locked in the order given.
pub(crate) async fn insert_into(
    tables: &[(Arc<Table>, f64)],
    data: Value,
    wait: Duration,
) -> Result<Vec<u64>, TableError> {
    let deadline = Instant::now() + wait;
    loop {
        let notified: Vec<_> = tables
            .iter()
            .map(|(table, _)| Box::pin(table.notify.notified()))
            .collect();

        let mut guards: Vec<MutexGuard<'_, TableState>> = Vec::with_capacity(tables.len());
        for (table, _) in tables {
            guards.push(table.state.lock().await);
        }

        let blocked = tables
            .iter()
            .zip(&guards)
            .find(|((table, _), state)| !table.can_insert(state))
            .map(|((table, _), _)| table.name().to_string());

        match blocked {
            None => {
                let keys = tables
                    .iter()
                    .zip(guards.iter_mut())
                    .map(|((table, priority), state)| table.push(state, data.clone(), *priority))
                    .collect();
                drop(guards);
                for (table, _) in tables {
                    table.notify.notify_waiters();
                }
                return Ok(keys);
            }
            Some(name) => {
                drop(guards);
                if notified.is_empty() || timeout_at(deadline, select_all(notified)).await.is_err() {
                    return Err(TableError::RateLimited {
                        table: name,
                        operation: "insert",
                    });
                }
            }
        }
    }
}
