//! Transaction-local view of a table's secondary indexes.
//!
//! Mutations are buffered per index until write-back. Scans merge pages read
//! from the remote index with the buffered mutations, so a transaction sees
//! its own inserts and removes.
use std::{
    cmp::Ordering,
    collections::{
        BTreeMap,
        VecDeque,
    },
    sync::Arc,
};

use anyhow::Context;
use common::{
    knobs::INDEX_SCAN_PAGE_SIZE,
    store::{
        IndexMutation,
        IndexOp,
        Order,
        RemoteStore,
        ScanStart,
        StoreError,
    },
    types::{
        Key,
        Snapshot,
        TableId,
        TableMetadata,
    },
};
use value::{
    FieldId,
    IndexKey,
    Tuple,
};

use crate::metrics::{
    log_index_page_fetch,
    log_index_write_keys,
};

/// One secondary index as seen by a transaction.
pub struct IndexWrapper {
    name: String,
    fields: Vec<FieldId>,
    /// Buffered mutations in index order. Opposite mutations of the same
    /// entry cancel instead of being stored.
    pending: BTreeMap<(IndexKey, Key), IndexOp>,
    /// Mutations already written to the remote index by this transaction.
    flushed: Vec<IndexMutation>,
}

impl IndexWrapper {
    fn new(name: String, fields: Vec<FieldId>) -> Self {
        Self {
            name,
            fields,
            pending: BTreeMap::new(),
            flushed: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }

    pub fn insert(&mut self, key: Key, tuple: &Tuple) {
        self.buffer(tuple.index_key(&self.fields), key, IndexOp::Insert);
    }

    pub fn remove(&mut self, key: Key, tuple: &Tuple) {
        self.buffer(tuple.index_key(&self.fields), key, IndexOp::Remove);
    }

    pub fn update(&mut self, key: Key, old: &Tuple, new: &Tuple) {
        let old_key = old.index_key(&self.fields);
        let new_key = new.index_key(&self.fields);
        if old_key == new_key {
            return;
        }
        self.buffer(old_key, key, IndexOp::Remove);
        self.buffer(new_key, key, IndexOp::Insert);
    }

    fn buffer(&mut self, index_key: IndexKey, key: Key, op: IndexOp) {
        let entry = (index_key, key);
        match self.pending.get(&entry) {
            Some(existing) if *existing == op.inverse() => {
                self.pending.remove(&entry);
            },
            _ => {
                self.pending.insert(entry, op);
            },
        }
    }

    /// Pending mutations in index order.
    pub fn cache(&self) -> impl Iterator<Item = IndexMutation> + '_ {
        self.pending.iter().map(|((key, value), op)| IndexMutation {
            key: key.clone(),
            value: *value,
            op: *op,
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn write_back(
        &mut self,
        store: &Arc<dyn RemoteStore>,
        snapshot: &Snapshot,
        table: TableId,
    ) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch: Vec<IndexMutation> = self.cache().collect();
        log_index_write_keys(batch.len());
        store
            .write_index(table, &self.name, snapshot, batch.clone())
            .await
            .with_context(|| format!("Failed to write index {:?} of table {table}", self.name))?;
        tracing::debug!(
            "Flushed {} entries to index {:?} of table {table}",
            batch.len(),
            self.name
        );
        self.pending.clear();
        self.flushed.extend(batch);
        Ok(())
    }

    async fn undo(
        &mut self,
        store: &Arc<dyn RemoteStore>,
        snapshot: &Snapshot,
        table: TableId,
    ) -> anyhow::Result<()> {
        if self.flushed.is_empty() {
            return Ok(());
        }
        // Newest first, so an entry flushed twice ends up as before.
        let inverse: Vec<IndexMutation> = self
            .flushed
            .iter()
            .rev()
            .map(IndexMutation::inverse)
            .collect();
        store
            .write_index(table, &self.name, snapshot, inverse)
            .await
            .with_context(|| format!("Failed to undo index {:?} of table {table}", self.name))?;
        self.flushed.clear();
        Ok(())
    }
}

/// All secondary indexes of one table within one transaction.
pub struct Indexes {
    table: TableId,
    indexes: BTreeMap<String, IndexWrapper>,
}

impl Indexes {
    fn wrappers(table: &TableMetadata) -> BTreeMap<String, IndexWrapper> {
        table
            .schema
            .indexes()
            .iter()
            .map(|(name, fields)| (name.clone(), IndexWrapper::new(name.clone(), fields.clone())))
            .collect()
    }

    /// Open every index declared on `table` for reading at `snapshot`.
    pub async fn open_indexes(
        snapshot: &Snapshot,
        store: &Arc<dyn RemoteStore>,
        table: &TableMetadata,
    ) -> anyhow::Result<Self> {
        for name in table.schema.indexes().keys() {
            match store.open_index(table.id, name, snapshot).await {
                Ok(()) => (),
                Err(StoreError::NotFound) => anyhow::bail!(
                    "Index {name:?} of table {:?} is missing from the remote store",
                    table.name
                ),
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to open index {name:?} of table {:?}", table.name)))
                },
            }
        }
        Ok(Self {
            table: table.id,
            indexes: Self::wrappers(table),
        })
    }

    /// Create every index declared on the newly created `table`.
    pub async fn create_indexes(
        store: &Arc<dyn RemoteStore>,
        table: &TableMetadata,
    ) -> anyhow::Result<Self> {
        for name in table.schema.indexes().keys() {
            store.create_index(table.id, name).await.with_context(|| {
                format!("Failed to create index {name:?} of table {:?}", table.name)
            })?;
        }
        Ok(Self {
            table: table.id,
            indexes: Self::wrappers(table),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexWrapper> {
        self.indexes.values()
    }

    pub fn get(&self, name: &str) -> Option<&IndexWrapper> {
        self.indexes.get(name)
    }

    pub fn insert(&mut self, key: Key, tuple: &Tuple) {
        for index in self.indexes.values_mut() {
            index.insert(key, tuple);
        }
    }

    pub fn update(&mut self, key: Key, old: &Tuple, new: &Tuple) {
        for index in self.indexes.values_mut() {
            index.update(key, old, new);
        }
    }

    pub fn remove(&mut self, key: Key, tuple: &Tuple) {
        for index in self.indexes.values_mut() {
            index.remove(key, tuple);
        }
    }

    /// Drop every buffered mutation.
    pub fn clear(&mut self) {
        for index in self.indexes.values_mut() {
            index.pending.clear();
        }
    }

    /// Flush buffered mutations one index at a time.
    pub async fn write_back(
        &mut self,
        store: &Arc<dyn RemoteStore>,
        snapshot: &Snapshot,
    ) -> anyhow::Result<()> {
        for index in self.indexes.values_mut() {
            index.write_back(store, snapshot, self.table).await?;
        }
        Ok(())
    }

    /// Revert the remote effect of every earlier `write_back`.
    pub async fn undo(
        &mut self,
        store: &Arc<dyn RemoteStore>,
        snapshot: &Snapshot,
    ) -> anyhow::Result<()> {
        for index in self.indexes.values_mut() {
            index.undo(store, snapshot, self.table).await?;
        }
        Ok(())
    }

    /// Scan `name` in ascending order from the first entry at or after `key`.
    pub fn lower_bound(
        &self,
        store: Arc<dyn RemoteStore>,
        snapshot: Snapshot,
        name: &str,
        key: IndexKey,
    ) -> anyhow::Result<IndexIterator> {
        self.scan(store, snapshot, name, key, Order::Asc)
    }

    /// Scan `name` in descending order from the last entry at or before `key`.
    pub fn reverse_lower_bound(
        &self,
        store: Arc<dyn RemoteStore>,
        snapshot: Snapshot,
        name: &str,
        key: IndexKey,
    ) -> anyhow::Result<IndexIterator> {
        self.scan(store, snapshot, name, key, Order::Desc)
    }

    fn scan(
        &self,
        store: Arc<dyn RemoteStore>,
        snapshot: Snapshot,
        name: &str,
        key: IndexKey,
        order: Order,
    ) -> anyhow::Result<IndexIterator> {
        let index = self
            .indexes
            .get(name)
            .with_context(|| format!("Table {} has no index {name:?}", self.table))?;
        let start = ScanStart::Inclusive(key);
        let admitted = index
            .pending
            .iter()
            .filter(|((index_key, value), _)| start.admits(order, index_key, *value))
            .map(|((index_key, value), op)| ((index_key.clone(), *value), *op));
        let pending: VecDeque<_> = match order {
            Order::Asc => admitted.collect(),
            Order::Desc => admitted.rev().collect(),
        };
        Ok(IndexIterator {
            store,
            snapshot,
            table: self.table,
            name: name.to_string(),
            order,
            page_size: *INDEX_SCAN_PAGE_SIZE,
            cursor: Some(start),
            remote: VecDeque::new(),
            pending,
        })
    }
}

/// Forward-only scan over one index, merging remote pages with the mutations
/// the transaction had buffered when the scan started.
pub struct IndexIterator {
    store: Arc<dyn RemoteStore>,
    snapshot: Snapshot,
    table: TableId,
    name: String,
    order: Order,
    page_size: usize,
    /// Where the next remote page starts. `None` once the remote index is
    /// exhausted.
    cursor: Option<ScanStart>,
    remote: VecDeque<(IndexKey, Key)>,
    pending: VecDeque<((IndexKey, Key), IndexOp)>,
}

impl IndexIterator {
    #[cfg(test)]
    pub(crate) fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// The primary key of the next entry, or `None` at the end of the index.
    pub async fn next(&mut self) -> anyhow::Result<Option<Key>> {
        Ok(self.next_entry().await?.map(|(_, key)| key))
    }

    pub async fn next_entry(&mut self) -> anyhow::Result<Option<(IndexKey, Key)>> {
        loop {
            if self.remote.is_empty() {
                self.fetch_page().await?;
            }
            let cmp = match (self.remote.front(), self.pending.front()) {
                (None, None) => return Ok(None),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(remote), Some((pending, _))) => match self.order {
                    Order::Asc => remote.cmp(pending),
                    Order::Desc => pending.cmp(remote),
                },
            };
            match cmp {
                Ordering::Less => return Ok(self.remote.pop_front()),
                Ordering::Equal => {
                    // The buffered mutation decides whether the entry survives.
                    let remote = self.remote.pop_front();
                    if let Some((_, IndexOp::Insert)) = self.pending.pop_front() {
                        return Ok(remote);
                    }
                },
                Ordering::Greater => {
                    if let Some((entry, IndexOp::Insert)) = self.pending.pop_front() {
                        return Ok(Some(entry));
                    }
                },
            }
        }
    }

    async fn fetch_page(&mut self) -> anyhow::Result<()> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(());
        };
        log_index_page_fetch();
        let page = self
            .store
            .index_range(
                self.table,
                &self.name,
                &self.snapshot,
                cursor,
                self.order,
                self.page_size,
            )
            .await
            .with_context(|| format!("Failed to scan index {:?} of table {}", self.name, self.table))?;
        if page.len() == self.page_size {
            if let Some((index_key, key)) = page.last() {
                self.cursor = Some(ScanStart::After(index_key.clone(), *key));
            }
        }
        self.remote.extend(page);
        Ok(())
    }
}
