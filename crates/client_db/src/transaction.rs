use std::{
    collections::HashMap,
    sync::Arc,
};

use anyhow::Context;
use common::{
    knobs::UNDO_LOG_CHUNK_SIZE_BYTES,
    scan::ScanQuery,
    store::StoreError,
    types::{
        Key,
        Snapshot,
        TableId,
    },
};
use errors::ErrorMetadata;
use value::{
    Field,
    IndexKey,
    Schema,
    Tuple,
};

use crate::{
    context::{
        TransactionContext,
        UNDO_LOG_FIELD,
    },
    future::Future,
    indexes::IndexIterator,
    metrics::{
        commit_timer,
        log_rollback,
        log_scan_rows,
        log_undo_log,
        scan_timer,
        log_unfinished_transaction,
    },
    remote_counter::RemoteCounter,
    transaction_cache::TransactionCache,
    undo_log::chunk_key,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionType {
    ReadWrite,
    ReadOnly,
    /// Long-running reads, e.g. for reporting. May not write.
    Analytical,
}

impl TransactionType {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionType::ReadOnly | TransactionType::Analytical)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A snapshot-isolated transaction. Writes are buffered until `commit`;
/// an unfinished transaction must be rolled back.
pub struct Transaction {
    context: Arc<TransactionContext>,
    cache: TransactionCache,
    transaction_type: TransactionType,
    state: TransactionState,
    /// Rows of the undo log written for the current write-back.
    undo_chunks: Vec<Key>,
}

impl AsMut<TransactionCache> for Transaction {
    fn as_mut(&mut self) -> &mut TransactionCache {
        &mut self.cache
    }
}

impl Transaction {
    pub(crate) fn new(
        context: Arc<TransactionContext>,
        snapshot: Snapshot,
        transaction_type: TransactionType,
    ) -> Self {
        Self {
            cache: TransactionCache::new(context.clone(), snapshot),
            context,
            transaction_type,
            state: TransactionState::Active,
            undo_chunks: vec![],
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.cache.snapshot()
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub async fn open_table(&mut self, name: &str) -> Future<TableId> {
        self.cache.open_table(name).await
    }

    pub async fn create_table(&mut self, name: &str, schema: Schema) -> anyhow::Result<TableId> {
        self.cache.create_table(name, schema).await
    }

    pub fn schema(&self, table: TableId) -> anyhow::Result<Arc<Schema>> {
        self.cache.schema(table)
    }

    /// An empty row of `table`.
    pub fn new_tuple(&self, table: TableId) -> anyhow::Result<Tuple> {
        Ok(Tuple::new(self.schema(table)?))
    }

    pub fn get(&self, table: TableId, key: Key) -> anyhow::Result<Future<Tuple>> {
        self.cache.get(table, key)
    }

    /// `get` and wait for the result.
    pub async fn read(&mut self, table: TableId, key: Key) -> anyhow::Result<Tuple> {
        let future = self.cache.get(table, key)?;
        future.get(&mut self.cache).await
    }

    pub fn insert(&mut self, table: TableId, key: Key, tuple: Tuple) -> anyhow::Result<()> {
        self.cache.insert(table, key, tuple)
    }

    /// Insert a row given as column values. Every NOT NULL column must be
    /// set and every name must be a column of the table.
    pub fn insert_values(
        &mut self,
        table: TableId,
        key: Key,
        values: HashMap<String, Field>,
    ) -> anyhow::Result<()> {
        let schema = self.schema(table)?;
        let mut tuple = Tuple::new(schema.clone());
        for name in values.keys() {
            if schema.id_of(name).is_none() {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "FieldDoesNotExist",
                    format!("Table {table} has no column {name:?}"),
                ));
            }
        }
        for (id, field) in schema.fields().iter().enumerate() {
            match values.get(&field.name) {
                Some(value) => tuple.set(id as u16, value.clone())?,
                None if field.not_null => anyhow::bail!(ErrorMetadata::bad_request(
                    "FieldNotSet",
                    format!("Column {:?} of table {table} is NOT NULL", field.name),
                )),
                None => (),
            }
        }
        self.insert(table, key, tuple)
    }

    pub fn update(
        &mut self,
        table: TableId,
        key: Key,
        old: &Tuple,
        new: Tuple,
    ) -> anyhow::Result<()> {
        self.cache.update(table, key, old, new)
    }

    pub fn remove(&mut self, table: TableId, key: Key, old: &Tuple) -> anyhow::Result<()> {
        self.cache.remove(table, key, old)
    }

    pub fn lower_bound(
        &self,
        table: TableId,
        index: &str,
        key: IndexKey,
    ) -> anyhow::Result<IndexIterator> {
        self.cache.lower_bound(table, index, key)
    }

    pub fn reverse_lower_bound(
        &self,
        table: TableId,
        index: &str,
        key: IndexKey,
    ) -> anyhow::Result<IndexIterator> {
        self.cache.reverse_lower_bound(table, index, key)
    }

    /// Run `query` over the table's rows as of the snapshot. Writes buffered
    /// in this transaction are not seen. Only analytical transactions scan,
    /// and the table only needs to be known to the client.
    pub async fn scan(&self, query: &ScanQuery) -> anyhow::Result<Vec<Tuple>> {
        anyhow::ensure!(
            self.transaction_type == TransactionType::Analytical,
            ErrorMetadata::bad_request(
                "ScanRequiresAnalytical",
                format!("Can't scan from a {:?} transaction", self.transaction_type),
            )
        );
        let table = query.table();
        let schema = self.schema(table)?;
        query.verify(&schema)?;
        let timer = scan_timer();
        let rows = match self.context.store().scan(self.snapshot(), query).await {
            Ok(rows) => rows,
            Err(StoreError::NotFound) => anyhow::bail!(ErrorMetadata::not_found(
                "TableNotFound",
                format!("Table {table} does not exist"),
            )),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to scan table {table}")))
            },
        };
        log_scan_rows(rows.len());
        timer.finish();
        Ok(rows)
    }

    pub async fn create_counter(&self, name: &str) -> anyhow::Result<Arc<RemoteCounter>> {
        self.context.create_counter(name).await
    }

    pub async fn get_counter(&self, name: &str) -> anyhow::Result<Arc<RemoteCounter>> {
        self.context.counter(name).await
    }

    fn ensure_active(&self) -> anyhow::Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => anyhow::bail!("Transaction was already committed"),
            TransactionState::RolledBack => anyhow::bail!("Transaction was already rolled back"),
        }
    }

    /// Persist the undo log, then apply every buffered change and, if
    /// `with_indexes`, every buffered index mutation. On error the
    /// transaction must be rolled back.
    pub async fn write_back(&mut self, with_indexes: bool) -> anyhow::Result<()> {
        self.ensure_active()?;
        if !self.cache.has_changes() {
            return Ok(());
        }
        anyhow::ensure!(
            !self.transaction_type.is_read_only(),
            ErrorMetadata::bad_request(
                "ReadOnlyTransaction",
                format!("Can't write from a {:?} transaction", self.transaction_type),
            )
        );
        let (len, log) = self.cache.undo_log(with_indexes);
        self.write_undo_log(len, log).await?;
        self.cache.write_back().await?;
        if with_indexes {
            self.cache.write_indexes().await?;
        }
        self.remove_undo_log().await
    }

    async fn write_undo_log(&mut self, len: usize, log: Vec<u8>) -> anyhow::Result<()> {
        let chunk_size = *UNDO_LOG_CHUNK_SIZE_BYTES;
        let num_chunks = len.div_ceil(chunk_size);
        anyhow::ensure!(
            num_chunks <= usize::from(u16::MAX),
            "Undo log of {len} bytes needs more than {} chunks",
            u16::MAX
        );
        log_undo_log(len, num_chunks);
        let transactions = self.context.client().transactions().clone();
        let store = self.context.store().clone();
        let snapshot = self.cache.snapshot().clone();
        for (chunk, bytes) in log.chunks(chunk_size).enumerate() {
            let key = chunk_key(snapshot.version(), chunk as u16);
            let row =
                Tuple::new(transactions.schema.clone()).with(UNDO_LOG_FIELD, bytes.to_vec())?;
            store
                .insert(transactions.id, key, &snapshot, row)
                .await
                .with_context(|| format!("Failed to write undo log chunk {chunk}"))?;
            self.undo_chunks.push(key);
        }
        Ok(())
    }

    async fn remove_undo_log(&mut self) -> anyhow::Result<()> {
        let transactions = self.context.client().transactions().id;
        let store = self.context.store().clone();
        let snapshot = self.cache.snapshot().clone();
        for key in self.undo_chunks.drain(..) {
            store
                .revert(transactions, key, &snapshot)
                .await
                .with_context(|| format!("Failed to remove undo log chunk {key}"))?;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> anyhow::Result<()> {
        let timer = commit_timer();
        self.write_back(true).await?;
        self.context
            .store()
            .commit(self.cache.snapshot())
            .await
            .context("Failed to commit snapshot")?;
        self.state = TransactionState::Committed;
        timer.finish();
        Ok(())
    }

    /// Undo everything the transaction wrote and release its snapshot.
    pub async fn rollback(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.state != TransactionState::Committed,
            "Can't roll back a committed transaction"
        );
        if self.state == TransactionState::RolledBack {
            return Ok(());
        }
        self.cache.rollback().await?;
        self.remove_undo_log().await?;
        self.context
            .store()
            .commit(self.cache.snapshot())
            .await
            .context("Failed to release snapshot")?;
        self.state = TransactionState::RolledBack;
        log_rollback();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            log_unfinished_transaction();
            tracing::warn!(
                "Transaction at version {} dropped without commit or rollback",
                self.cache.snapshot().version()
            );
        }
    }
}
