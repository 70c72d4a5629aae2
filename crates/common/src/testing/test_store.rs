use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use cmd_util::env::config_test;
use parking_lot::Mutex;
use value::{
    IndexKey,
    Schema,
    TableType,
    Tuple,
};

use crate::{
    scan::ScanQuery,
    store::{
        IndexMutation,
        IndexOp,
        Order,
        RemoteStore,
        ScanStart,
        StoreError,
        StoreResult,
        VersionedTuple,
    },
    types::{
        Key,
        Snapshot,
        TableId,
        TableMetadata,
        Version,
    },
};

/// Version history of one row or index entry, oldest first. Each transaction
/// writes at most one record per row, at its own version.
type History<T> = Vec<(Version, T)>;

/// In-memory `RemoteStore` with multi-version rows, snapshot visibility and
/// version-checked writes. Clones share state, so one handle can be given to
/// the client while the test inspects another.
#[derive(Clone)]
pub struct TestStore {
    inner: Arc<Mutex<Inner>>,
}

struct StoredTable {
    metadata: TableMetadata,
    rows: BTreeMap<Key, History<Option<Tuple>>>,
    indexes: BTreeMap<String, BTreeMap<(IndexKey, Key), History<bool>>>,
}

impl StoredTable {
    fn is_transactional(&self) -> bool {
        self.metadata.schema.table_type() == TableType::Transactional
    }
}

struct Inner {
    last_version: Version,
    base_version: Version,
    committed_above_base: BTreeSet<Version>,
    next_table_id: u64,
    table_names: BTreeMap<String, TableId>,
    tables: BTreeMap<TableId, StoredTable>,
    calls: BTreeMap<&'static str, usize>,
    injected_failures: BTreeMap<&'static str, VecDeque<StoreError>>,
    latency: Option<Duration>,
}

impl Inner {
    fn record_call(&mut self, op: &'static str) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.injected_failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn table(&self, id: TableId) -> StoreResult<&StoredTable> {
        self.tables
            .get(&id)
            .ok_or_else(|| StoreError::Other(format!("Unknown table {id}")))
    }

    fn table_mut(&mut self, id: TableId) -> StoreResult<&mut StoredTable> {
        self.tables
            .get_mut(&id)
            .ok_or_else(|| StoreError::Other(format!("Unknown table {id}")))
    }
}

/// Newest record the snapshot can read, with its position in the history.
/// Non-transactional tables always read the newest record.
fn visible<'a, T>(
    history: &'a History<T>,
    snapshot: &Snapshot,
    transactional: bool,
) -> Option<(usize, &'a (Version, T))> {
    history
        .iter()
        .enumerate()
        .rev()
        .find(|(_, (version, _))| !transactional || snapshot.is_visible(*version))
}

/// Record `value` at the snapshot's version, replacing an earlier write by
/// the same snapshot so retries are idempotent.
fn write_record<T>(history: &mut History<T>, snapshot: &Snapshot, value: T) {
    match history.last_mut() {
        Some((version, old)) if *version == snapshot.version() => *old = value,
        _ => history.push((snapshot.version(), value)),
    }
}

impl TestStore {
    pub fn new() -> Self {
        config_test();
        let inner = Inner {
            last_version: Version::MIN,
            base_version: Version::MIN,
            committed_above_base: BTreeSet::new(),
            next_table_id: 1,
            table_names: BTreeMap::new(),
            tables: BTreeMap::new(),
            calls: BTreeMap::new(),
            injected_failures: BTreeMap::new(),
            latency: None,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Number of times `op` (the `RemoteStore` method name) was called.
    pub fn calls(&self, op: &str) -> usize {
        self.inner.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Make the next call to `op` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: &'static str, error: StoreError) {
        self.inner
            .lock()
            .injected_failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// Full version history of a row, committed or not.
    pub fn row_history(&self, table: TableId, key: Key) -> Vec<(Version, Option<Tuple>)> {
        let inner = self.inner.lock();
        inner
            .tables
            .get(&table)
            .and_then(|t| t.rows.get(&key))
            .cloned()
            .unwrap_or_default()
    }

    /// Entries currently present in an index, ignoring snapshots.
    pub fn index_entries(&self, table: TableId, name: &str) -> Vec<(IndexKey, Key)> {
        let inner = self.inner.lock();
        let Some(index) = inner.tables.get(&table).and_then(|t| t.indexes.get(name)) else {
            return vec![];
        };
        index
            .iter()
            .filter(|(_, history)| history.last().is_some_and(|(_, present)| *present))
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    async fn call(&self, op: &'static str) -> StoreResult<()> {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.inner.lock().record_call(op)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for TestStore {
    async fn start_snapshot(&self) -> StoreResult<Snapshot> {
        self.call("start_snapshot").await?;
        let mut inner = self.inner.lock();
        inner.last_version = inner.last_version.succ();
        Ok(Snapshot::new(
            inner.last_version,
            inner.base_version,
            inner.committed_above_base.clone(),
        ))
    }

    async fn commit(&self, snapshot: &Snapshot) -> StoreResult<()> {
        self.call("commit").await?;
        let mut inner = self.inner.lock();
        let version = snapshot.version();
        if version <= inner.base_version || !inner.committed_above_base.insert(version) {
            return Err(StoreError::InvalidWrite(format!(
                "Version {version} is already committed"
            )));
        }
        loop {
            let next = inner.base_version.succ();
            if !inner.committed_above_base.remove(&next) {
                break;
            }
            inner.base_version = next;
        }
        Ok(())
    }

    async fn get_table(&self, name: &str) -> StoreResult<TableMetadata> {
        self.call("get_table").await?;
        let inner = self.inner.lock();
        let id = inner.table_names.get(name).ok_or(StoreError::NotFound)?;
        Ok(inner.table(*id)?.metadata.clone())
    }

    async fn create_table(&self, name: &str, schema: Schema) -> StoreResult<TableMetadata> {
        self.call("create_table").await?;
        let mut inner = self.inner.lock();
        if inner.table_names.contains_key(name) {
            return Err(StoreError::InvalidWrite(format!(
                "Table {name:?} already exists"
            )));
        }
        let id = TableId::new(inner.next_table_id);
        inner.next_table_id += 1;
        let metadata = TableMetadata {
            id,
            name: name.to_string(),
            schema: Arc::new(schema),
        };
        inner.table_names.insert(name.to_string(), id);
        inner.tables.insert(
            id,
            StoredTable {
                metadata: metadata.clone(),
                rows: BTreeMap::new(),
                indexes: BTreeMap::new(),
            },
        );
        Ok(metadata)
    }

    async fn get(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
    ) -> StoreResult<VersionedTuple> {
        self.call("get").await?;
        let inner = self.inner.lock();
        let table = inner.table(table)?;
        let history = table.rows.get(&key).ok_or(StoreError::NotFound)?;
        let (position, (version, tuple)) = visible(history, snapshot, table.is_transactional())
            .ok_or(StoreError::NotFound)?;
        let tuple = tuple.clone().ok_or(StoreError::NotFound)?;
        Ok(VersionedTuple {
            tuple,
            version: *version,
            is_newest: position + 1 == history.len(),
        })
    }

    async fn insert(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
        tuple: Tuple,
    ) -> StoreResult<()> {
        self.call("insert").await?;
        let mut inner = self.inner.lock();
        let table = inner.table_mut(table)?;
        let transactional = table.is_transactional();
        let history = table.rows.entry(key).or_default();
        match history.last() {
            None => (),
            Some((version, _)) if *version == snapshot.version() => (),
            Some((version, None)) if !transactional || snapshot.is_visible(*version) => (),
            Some(_) => return Err(StoreError::NotInSnapshot),
        }
        write_record(history, snapshot, Some(tuple));
        Ok(())
    }

    async fn update(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
        expected: Version,
        tuple: Tuple,
    ) -> StoreResult<()> {
        self.call("update").await?;
        let mut inner = self.inner.lock();
        let history = inner
            .table_mut(table)?
            .rows
            .get_mut(&key)
            .ok_or(StoreError::NotFound)?;
        check_expected(history, snapshot, expected)?;
        write_record(history, snapshot, Some(tuple));
        Ok(())
    }

    async fn remove(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
        expected: Version,
    ) -> StoreResult<()> {
        self.call("remove").await?;
        let mut inner = self.inner.lock();
        let history = inner
            .table_mut(table)?
            .rows
            .get_mut(&key)
            .ok_or(StoreError::NotFound)?;
        check_expected(history, snapshot, expected)?;
        write_record(history, snapshot, None);
        Ok(())
    }

    async fn revert(&self, table: TableId, key: Key, snapshot: &Snapshot) -> StoreResult<()> {
        self.call("revert").await?;
        let mut inner = self.inner.lock();
        let rows = &mut inner.table_mut(table)?.rows;
        if let Some(history) = rows.get_mut(&key) {
            if history.last().map(|(version, _)| *version) == Some(snapshot.version()) {
                history.pop();
            }
            if history.is_empty() {
                rows.remove(&key);
            }
        }
        Ok(())
    }

    async fn create_index(&self, table: TableId, name: &str) -> StoreResult<()> {
        self.call("create_index").await?;
        let mut inner = self.inner.lock();
        let indexes = &mut inner.table_mut(table)?.indexes;
        if indexes.contains_key(name) {
            return Err(StoreError::InvalidWrite(format!(
                "Index {name:?} already exists"
            )));
        }
        indexes.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn open_index(
        &self,
        table: TableId,
        name: &str,
        _snapshot: &Snapshot,
    ) -> StoreResult<()> {
        self.call("open_index").await?;
        let inner = self.inner.lock();
        if !inner.table(table)?.indexes.contains_key(name) {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn index_range(
        &self,
        table: TableId,
        name: &str,
        snapshot: &Snapshot,
        start: ScanStart,
        order: Order,
        limit: usize,
    ) -> StoreResult<Vec<(IndexKey, Key)>> {
        self.call("index_range").await?;
        let inner = self.inner.lock();
        let table = inner.table(table)?;
        let transactional = table.is_transactional();
        let index = table.indexes.get(name).ok_or(StoreError::NotFound)?;
        let entries: Box<dyn Iterator<Item = _>> = match order {
            Order::Asc => Box::new(index.iter()),
            Order::Desc => Box::new(index.iter().rev()),
        };
        Ok(entries
            .filter(|((key, value), _)| start.admits(order, key, *value))
            .filter(|(_, history)| {
                visible(*history, snapshot, transactional).is_some_and(|(_, (_, present))| *present)
            })
            .take(limit)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn write_index(
        &self,
        table: TableId,
        name: &str,
        snapshot: &Snapshot,
        mutations: Vec<IndexMutation>,
    ) -> StoreResult<()> {
        self.call("write_index").await?;
        let mut inner = self.inner.lock();
        let index = inner
            .table_mut(table)?
            .indexes
            .get_mut(name)
            .ok_or(StoreError::NotFound)?;
        for mutation in mutations {
            let history = index.entry((mutation.key, mutation.value)).or_default();
            write_record(history, snapshot, mutation.op == IndexOp::Insert);
        }
        Ok(())
    }

    async fn scan(&self, snapshot: &Snapshot, query: &ScanQuery) -> StoreResult<Vec<Tuple>> {
        self.call("scan").await?;
        let inner = self.inner.lock();
        let table = inner.tables.get(&query.table()).ok_or(StoreError::NotFound)?;
        let transactional = table.is_transactional();
        let rows = table
            .rows
            .values()
            .filter_map(|history| visible(history, snapshot, transactional))
            .filter_map(|(_, (_, tuple))| tuple.as_ref());
        query
            .execute(&table.metadata.schema, rows)
            .map_err(|e| StoreError::Other(format!("Scan failed: {e:#}")))
    }
}

fn check_expected(
    history: &History<Option<Tuple>>,
    snapshot: &Snapshot,
    expected: Version,
) -> StoreResult<()> {
    let Some((version, tuple)) = history.last() else {
        return Err(StoreError::NotFound);
    };
    if *version == snapshot.version() {
        return Ok(());
    }
    if *version != expected {
        return Err(StoreError::NotInSnapshot);
    }
    if tuple.is_none() {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use value::{
        Field,
        FieldType,
        IndexKey,
        Schema,
        TableType,
        Tuple,
    };

    use crate::{
        scan::{
            Conjunct,
            PredicateType,
            ScanQuery,
        },
        store::{
            IndexMutation,
            IndexOp,
            Order,
            RemoteStore,
            ScanStart,
            StoreError,
        },
        testing::TestStore,
        types::Key,
    };

    fn schema() -> anyhow::Result<Schema> {
        let mut schema = Schema::new(TableType::Transactional);
        schema.add_field(FieldType::BigInt, "balance", true)?;
        Ok(schema)
    }

    fn tuple(schema: &Arc<Schema>, balance: i64) -> anyhow::Result<Tuple> {
        Tuple::new(schema.clone()).with("balance", balance)
    }

    #[tokio::test]
    async fn test_scan_reads_the_snapshot() -> anyhow::Result<()> {
        let store = TestStore::new();
        let table = store.create_table("accounts", schema()?).await?;
        let setup = store.start_snapshot().await?;
        for (key, balance) in [(1, 10), (2, 20), (3, 30)] {
            store
                .insert(table.id, Key::new(key), &setup, tuple(&table.schema, balance)?)
                .await?;
        }
        store.commit(&setup).await?;

        let reader = store.start_snapshot().await?;
        let writer = store.start_snapshot().await?;
        let read = store.get(table.id, Key::new(2), &writer).await?;
        store
            .remove(table.id, Key::new(2), &writer, read.version)
            .await?;
        store.commit(&writer).await?;

        let query = ScanQuery::full(table.id)
            .and(Conjunct::new().or(PredicateType::GreaterEqual, 0, Field::BigInt(20)));
        assert_eq!(
            store.scan(&reader, &query).await?,
            vec![tuple(&table.schema, 20)?, tuple(&table.schema, 30)?]
        );
        let later = store.start_snapshot().await?;
        assert_eq!(
            store.scan(&later, &query).await?,
            vec![tuple(&table.schema, 30)?]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_isolation() -> anyhow::Result<()> {
        let store = TestStore::new();
        let table = store.create_table("accounts", schema()?).await?;
        let key = Key::new(1);

        let writer = store.start_snapshot().await?;
        store
            .insert(table.id, key, &writer, tuple(&table.schema, 100)?)
            .await?;
        // Uncommitted writes are only visible to their own snapshot.
        let concurrent = store.start_snapshot().await?;
        assert_eq!(
            store.get(table.id, key, &concurrent).await.unwrap_err(),
            StoreError::NotFound
        );
        assert_eq!(
            store.get(table.id, key, &writer).await?.tuple,
            tuple(&table.schema, 100)?
        );
        store.commit(&writer).await?;

        // Still invisible to the snapshot issued before the commit.
        assert!(store.get(table.id, key, &concurrent).await.is_err());
        let reader = store.start_snapshot().await?;
        let read = store.get(table.id, key, &reader).await?;
        assert_eq!(read.version, writer.version());
        assert!(read.is_newest);

        // A stale expected version loses.
        store
            .update(table.id, key, &reader, read.version, tuple(&table.schema, 50)?)
            .await?;
        let late = store.start_snapshot().await?;
        assert_eq!(
            store
                .remove(table.id, key, &late, writer.version())
                .await
                .unwrap_err(),
            StoreError::NotInSnapshot
        );
        assert!(!store.get(table.id, key, &late).await?.is_newest);

        store.revert(table.id, key, &reader).await?;
        assert_eq!(store.row_history(table.id, key).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_index_writes_are_idempotent() -> anyhow::Result<()> {
        let store = TestStore::new();
        let table = store.create_table("accounts", schema()?).await?;
        store.create_index(table.id, "by_balance").await?;
        assert_eq!(
            store
                .create_index(table.id, "by_balance")
                .await
                .unwrap_err(),
            StoreError::InvalidWrite("Index \"by_balance\" already exists".to_string())
        );

        let snapshot = store.start_snapshot().await?;
        let mutations: Vec<_> = (1..=3)
            .map(|i| IndexMutation {
                key: IndexKey::new(&[Field::BigInt(i * 10)]),
                value: Key::new(i as u64),
                op: IndexOp::Insert,
            })
            .collect();
        store
            .write_index(table.id, "by_balance", &snapshot, mutations.clone())
            .await?;
        store
            .write_index(table.id, "by_balance", &snapshot, mutations)
            .await?;
        let page = store
            .index_range(
                table.id,
                "by_balance",
                &snapshot,
                ScanStart::Inclusive(IndexKey::new(&[Field::BigInt(20)])),
                Order::Desc,
                10,
            )
            .await?;
        assert_eq!(
            page,
            vec![
                (IndexKey::new(&[Field::BigInt(20)]), Key::new(2)),
                (IndexKey::new(&[Field::BigInt(10)]), Key::new(1)),
            ]
        );
        assert_eq!(store.calls("write_index"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures() -> anyhow::Result<()> {
        let store = TestStore::new();
        store.fail_next("get_table", StoreError::Other("unavailable".to_string()));
        assert!(store.get_table("accounts").await.is_err());
        assert_eq!(
            store.get_table("accounts").await.unwrap_err(),
            StoreError::NotFound
        );
        Ok(())
    }
}
