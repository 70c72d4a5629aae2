//! Client-side allocation of increasing keys backed by a counter row in the
//! remote store.
//!
//! Every client reserves keys from the counter row in batches: a batch request
//! reads the persisted value `p`, conditionally writes `p + batch` and hands
//! out the keys in `(p, p + batch]` locally. When few keys remain in the
//! current range, the next batch is requested in the background so callers
//! rarely wait for the remote store.
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    knobs::{
        COUNTER_CONFLICT_INITIAL_BACKOFF,
        COUNTER_CONFLICT_MAX_BACKOFF,
        COUNTER_CONFLICT_MAX_RETRIES,
        COUNTER_PREFETCH_THRESHOLD,
        COUNTER_RESERVED_BATCH,
    },
    store::{
        RemoteStore,
        StoreError,
    },
    types::{
        Key,
        TableId,
        TableMetadata,
    },
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::sync::watch;
use value::{
    Field,
    FieldType,
    Schema,
    TableType,
    Tuple,
};

use crate::metrics::{
    counter_batch_timer,
    log_counter_conflict_retry,
    log_counter_wait,
};

/// Prefix of the tables holding counter rows. Counter `orders` lives in
/// `__global_counter_orders`.
pub const COUNTER_TABLE_PREFIX: &str = "__global_counter_";

/// Row of the counter table holding the persisted value.
pub const COUNTER_ID: Key = Key::new(1);

pub const COUNTER_FIELD: &str = "counter";

pub fn counter_table_name(name: &str) -> String {
    format!("{COUNTER_TABLE_PREFIX}{name}")
}

#[derive(Clone, Debug)]
pub struct CounterConfig {
    /// Keys reserved per batch request.
    pub reserved_batch: u64,
    /// Remaining keys in the current range at which the next batch is
    /// prefetched.
    pub threshold: u64,
    /// Lost races on the counter row tolerated per batch request.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            reserved_batch: *COUNTER_RESERVED_BATCH,
            threshold: *COUNTER_PREFETCH_THRESHOLD,
            max_retries: *COUNTER_CONFLICT_MAX_RETRIES,
            initial_backoff: *COUNTER_CONFLICT_INITIAL_BACKOFF,
            max_backoff: *COUNTER_CONFLICT_MAX_BACKOFF,
        }
    }
}

impl CounterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            0 < self.threshold && self.threshold < self.reserved_batch,
            ErrorMetadata::bad_request(
                "InvalidCounterConfig",
                format!(
                    "Counter prefetch threshold {} must be nonzero and smaller than the reserved \
                     batch {}",
                    self.threshold, self.reserved_batch
                ),
            )
        );
        Ok(())
    }
}

/// Allocates keys that are strictly increasing across every caller on this
/// client. Cheap to share: clones of the `Arc` the context hands out all
/// draw from the same range.
pub struct RemoteCounter {
    inner: Arc<CounterInner>,
}

impl fmt::Debug for RemoteCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RemoteCounter")
            .field("name", &self.name())
            .field("table", &self.inner.table.id)
            .field("current", &state.current)
            .field("reserved", &state.reserved)
            .finish_non_exhaustive()
    }
}

struct CounterInner {
    store: Arc<dyn RemoteStore>,
    table: TableMetadata,
    config: CounterConfig,
    state: Mutex<CounterState>,
    /// Bumped whenever a batch request finishes, successfully or not.
    generation: watch::Sender<u64>,
}

#[derive(Default)]
struct CounterState {
    /// Last key handed out.
    current: u64,
    /// Last key of the current range. The range is exhausted once
    /// `current == reserved`.
    reserved: u64,
    /// First key (exclusive) of a prefetched range.
    next: Option<u64>,
    requesting: bool,
    /// Generation at which the last batch request failed, with its error.
    failure: Option<(u64, Arc<anyhow::Error>)>,
}

impl RemoteCounter {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        table: TableMetadata,
        config: CounterConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let (generation, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(CounterInner {
                store,
                table,
                config,
                state: Mutex::new(CounterState::default()),
                generation,
            }),
        })
    }

    /// Create the table holding the counter `name`. The counter row itself is
    /// written by the first batch request.
    pub async fn create_table(
        store: &Arc<dyn RemoteStore>,
        name: &str,
    ) -> anyhow::Result<TableMetadata> {
        let mut schema = Schema::new(TableType::NonTransactional);
        schema.add_field(FieldType::BigInt, COUNTER_FIELD, true)?;
        let table_name = counter_table_name(name);
        match store.create_table(&table_name, schema).await {
            Ok(metadata) => Ok(metadata),
            Err(StoreError::InvalidWrite(_)) => anyhow::bail!(ErrorMetadata::bad_request(
                "CounterExists",
                format!("Counter {name:?} already exists"),
            )),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to create counter table {table_name:?}"))),
        }
    }

    pub fn table(&self) -> TableId {
        self.inner.table.id
    }

    pub fn name(&self) -> &str {
        self.inner
            .table
            .name
            .strip_prefix(COUNTER_TABLE_PREFIX)
            .unwrap_or(&self.inner.table.name)
    }

    /// Return a key greater than every key this counter has returned so far.
    pub async fn increment_and_get(&self) -> anyhow::Result<u64> {
        let mut generation = self.inner.generation.subscribe();
        let mut parked_at: Option<u64> = None;
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.current == state.reserved {
                    if let Some(next) = state.next.take() {
                        state.current = next;
                        state.reserved = next + self.inner.config.reserved_batch;
                    }
                }
                if state.current < state.reserved {
                    state.current += 1;
                    let key = state.current;
                    if state.reserved - state.current == self.inner.config.threshold
                        && state.next.is_none()
                        && !state.requesting
                    {
                        tracing::debug!("Prefetching counter batch for table {}", self.table());
                        self.request_batch(&mut state);
                    }
                    return Ok(key);
                }
                if let (Some(parked_at), Some((failed_at, error))) = (parked_at, &state.failure) {
                    if *failed_at > parked_at {
                        anyhow::bail!("Counter batch request failed: {error:#}");
                    }
                }
                log_counter_wait(state.requesting);
                if !state.requesting {
                    self.request_batch(&mut state);
                }
                // Read the generation while holding the state lock: a request
                // finishing after this point is guaranteed to wake us.
                parked_at = Some(*generation.borrow_and_update());
            }
            generation.changed().await?;
        }
    }

    /// Spawn a batch request. The task is detached, so a caller that stops
    /// waiting doesn't cancel it.
    fn request_batch(&self, state: &mut CounterState) {
        state.requesting = true;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.reserve_batch().await;
            inner.finish_batch(result);
        });
    }
}

impl CounterInner {
    fn finish_batch(&self, result: anyhow::Result<u64>) {
        let mut state = self.state.lock();
        state.requesting = false;
        match result {
            Ok(start) => {
                if state.current == state.reserved {
                    state.current = start;
                    state.reserved = start + self.config.reserved_batch;
                } else {
                    state.next = Some(start);
                }
            },
            Err(e) => {
                tracing::error!(
                    "Counter batch request for table {} failed: {e:#}",
                    self.table.id
                );
                let failed_at = *self.generation.borrow() + 1;
                state.failure = Some((failed_at, Arc::new(e)));
            },
        }
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Move the persisted counter forward by one batch and return its
    /// previous value. Retries lost races with backoff.
    async fn reserve_batch(&self) -> anyhow::Result<u64> {
        let timer = counter_batch_timer();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        loop {
            match self.try_reserve_batch().await {
                Ok(start) => {
                    timer.finish();
                    return Ok(start);
                },
                Err(StoreError::NotInSnapshot | StoreError::NotFound) => {
                    if backoff.failures() >= self.config.max_retries {
                        timer.finish_with("conflict");
                        anyhow::bail!(
                            "Gave up reserving a counter batch for table {} after {} conflicts",
                            self.table.id,
                            backoff.failures()
                        );
                    }
                    log_counter_conflict_retry();
                    let delay = backoff.fail(&mut rand::rng());
                    tracing::warn!(
                        "Lost a race on counter table {}, retrying in {delay:?}",
                        self.table.id
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!(
                        "Failed to reserve a batch on counter table {}",
                        self.table.id
                    )));
                },
            }
        }
    }

    async fn try_reserve_batch(&self) -> Result<u64, StoreError> {
        let table = self.table.id;
        let snapshot = self.store.start_snapshot().await?;
        let result = async {
            let (start, expected) = match self.store.get(table, COUNTER_ID, &snapshot).await {
                Ok(row) => (counter_value(&row.tuple)?, Some(row.version)),
                Err(StoreError::NotFound) => (0, None),
                Err(e) => return Err(e),
            };
            let reserved = start + self.config.reserved_batch;
            let tuple = Tuple::new(self.table.schema.clone())
                .with(COUNTER_FIELD, Field::BigInt(reserved as i64))
                .map_err(|e| StoreError::Other(format!("{e:#}")))?;
            match expected {
                Some(version) => {
                    self.store
                        .update(table, COUNTER_ID, &snapshot, version, tuple)
                        .await?
                },
                None => self.store.insert(table, COUNTER_ID, &snapshot, tuple).await?,
            }
            Ok(start)
        }
        .await;
        // Release the snapshot whether or not the write went through.
        self.store.commit(&snapshot).await?;
        result
    }
}

fn counter_value(tuple: &Tuple) -> Result<u64, StoreError> {
    tuple
        .get_by_name(COUNTER_FIELD)
        .and_then(|field| field.as_i64().ok())
        .and_then(|value| u64::try_from(value).ok())
        .ok_or_else(|| StoreError::Other(format!("Malformed counter row {tuple:?}")))
}
