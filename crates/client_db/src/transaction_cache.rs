use std::{
    collections::BTreeMap,
    sync::Arc,
};

use anyhow::Context;
use common::{
    store::{
        RemoteStore,
        StoreError,
    },
    types::{
        Key,
        Snapshot,
        TableId,
        TableMetadata,
    },
};
use errors::ErrorMetadata;
use value::{
    IndexKey,
    Schema,
    Tuple,
};

use crate::{
    context::TransactionContext,
    future::{
        Future,
        Register,
    },
    indexes::{
        IndexIterator,
        Indexes,
    },
    table_cache::TableCache,
    undo_log::UndoLog,
};

/// Everything one transaction has read and buffered, per table.
pub struct TransactionCache {
    context: Arc<TransactionContext>,
    store: Arc<dyn RemoteStore>,
    snapshot: Snapshot,
    tables: BTreeMap<TableId, TableCache>,
}

impl AsMut<TransactionCache> for TransactionCache {
    fn as_mut(&mut self) -> &mut TransactionCache {
        self
    }
}

impl TransactionCache {
    pub fn new(context: Arc<TransactionContext>, snapshot: Snapshot) -> Self {
        let store = context.store().clone();
        Self {
            context,
            store,
            snapshot,
            tables: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableCache> {
        self.tables.values()
    }

    pub(crate) fn table(&self, id: TableId) -> anyhow::Result<&TableCache> {
        self.tables
            .get(&id)
            .with_context(|| format!("Table {id} was not opened in this transaction"))
    }

    pub(crate) fn table_mut(&mut self, id: TableId) -> anyhow::Result<&mut TableCache> {
        self.tables
            .get_mut(&id)
            .with_context(|| format!("Table {id} was not opened in this transaction"))
    }

    /// Add a table to this transaction unless a concurrent open already did.
    fn register_table(&mut self, table: TableMetadata, indexes: Indexes) -> TableId {
        let id = table.id;
        let store = self.store.clone();
        let snapshot = self.snapshot.clone();
        self.tables
            .entry(id)
            .or_insert_with(|| TableCache::new(table, store, snapshot, indexes));
        id
    }

    /// Open `name` for this transaction. A table the client already knows is
    /// added right away and the returned future is ready; otherwise it is
    /// looked up remotely and added once the future is waited on.
    pub async fn open_table(&mut self, name: &str) -> Future<TableId> {
        if let Some(table) = self.context.table_by_name(name) {
            if self.tables.contains_key(&table.id) {
                return Future::ready(table.id);
            }
            // Known to the client but new to this transaction: only the
            // indexes need to be opened.
            return match Indexes::open_indexes(&self.snapshot, &self.store, &table).await {
                Ok(indexes) => Future::ready(self.register_table(table, indexes)),
                Err(e) => Future::failed(e),
            };
        }
        let store = self.store.clone();
        let snapshot = self.snapshot.clone();
        let name = name.to_string();
        Future::pending(async move {
            let table = match store.get_table(&name).await {
                Ok(table) => table,
                Err(StoreError::NotFound) => anyhow::bail!(ErrorMetadata::not_found(
                    "TableNotFound",
                    format!("Table {name:?} does not exist"),
                )),
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("Failed to open table {name:?}")))
                },
            };
            let indexes = Indexes::open_indexes(&snapshot, &store, &table).await?;
            let register: Register<TableId> = Box::new(move |cache: &mut TransactionCache| {
                let table = cache.context.register_table(table);
                Ok(cache.register_table(table, indexes))
            });
            Ok(register)
        })
    }

    pub async fn create_table(&mut self, name: &str, schema: Schema) -> anyhow::Result<TableId> {
        value::check_valid_name(name)?;
        let table = match self.store.create_table(name, schema).await {
            Ok(table) => table,
            Err(StoreError::InvalidWrite(_)) => anyhow::bail!(ErrorMetadata::bad_request(
                "TableExists",
                format!("Table {name:?} already exists"),
            )),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to create table {name:?}")))
            },
        };
        let indexes = Indexes::create_indexes(&self.store, &table).await?;
        tracing::info!("Created table {name:?} with id {}", table.id);
        let table = self.context.register_table(table);
        Ok(self.register_table(table, indexes))
    }

    /// Schema of `table`, which only needs to be known to the client.
    pub fn schema(&self, table: TableId) -> anyhow::Result<Arc<Schema>> {
        if let Some(cache) = self.tables.get(&table) {
            return Ok(cache.schema().clone());
        }
        match self.context.table(table) {
            Some(metadata) => Ok(metadata.schema),
            None => anyhow::bail!(ErrorMetadata::not_found(
                "TableNotFound",
                format!("Table {table} is unknown to this client"),
            )),
        }
    }

    pub fn get(&self, table: TableId, key: Key) -> anyhow::Result<Future<Tuple>> {
        Ok(self.table(table)?.get(key))
    }

    pub fn insert(&mut self, table: TableId, key: Key, tuple: Tuple) -> anyhow::Result<()> {
        self.table_mut(table)?.insert(key, tuple)
    }

    pub fn update(
        &mut self,
        table: TableId,
        key: Key,
        old: &Tuple,
        new: Tuple,
    ) -> anyhow::Result<()> {
        self.table_mut(table)?.update(key, old, new)
    }

    pub fn remove(&mut self, table: TableId, key: Key, old: &Tuple) -> anyhow::Result<()> {
        self.table_mut(table)?.remove(key, old)
    }

    pub fn lower_bound(
        &self,
        table: TableId,
        index: &str,
        key: IndexKey,
    ) -> anyhow::Result<IndexIterator> {
        self.table(table)?.lower_bound(index, key)
    }

    pub fn reverse_lower_bound(
        &self,
        table: TableId,
        index: &str,
        key: IndexKey,
    ) -> anyhow::Result<IndexIterator> {
        self.table(table)?.reverse_lower_bound(index, key)
    }

    pub fn has_changes(&self) -> bool {
        self.tables.values().any(TableCache::has_changes)
    }

    pub async fn rollback(&mut self) -> anyhow::Result<()> {
        for table in self.tables.values_mut() {
            table.rollback().await?;
        }
        Ok(())
    }

    /// Write every table's changes back. Stops at the first table that fails;
    /// the transaction must then be rolled back.
    pub async fn write_back(&mut self) -> anyhow::Result<()> {
        for table in self.tables.values_mut() {
            if table.has_changes() {
                table.write_back().await?;
            }
        }
        Ok(())
    }

    pub async fn write_indexes(&mut self) -> anyhow::Result<()> {
        for table in self.tables.values_mut() {
            table.write_indexes().await?;
        }
        Ok(())
    }

    /// Encode the keys (and optionally pending index entries) this
    /// transaction is about to write. Returns the encoded length along with
    /// the bytes.
    pub fn undo_log(&self, with_indexes: bool) -> (usize, Vec<u8>) {
        let tables: Vec<&TableCache> = self
            .tables
            .values()
            .filter(|table| table.has_changes())
            .collect();
        let len = UndoLog::encoded_len(&tables, with_indexes);
        let mut buf = Vec::with_capacity(len);
        UndoLog::encode(&tables, with_indexes, &mut buf);
        assert_eq!(len, buf.len(), "undo log length mismatch");
        (len, buf)
    }
}
