//! Reads and buffered writes of one table within one transaction.
//!
//! Every key the transaction writes has exactly one [`Change`], holding the
//! row as it was before the transaction and the row as the transaction left
//! it. Further operations on the same key merge into that record:
//!
//! | record \ op   | insert(v)    | update(old, new)              | remove(old)                  |
//! |---------------|--------------|-------------------------------|------------------------------|
//! | none, present | TupleExists  | `Update(orig -> new)`         | `Remove(orig)`               |
//! | none, absent  | `Insert(v)`  | TupleDoesNotExist             | TupleDoesNotExist            |
//! | `Insert(a)`   | TupleExists  | `Insert(new)`                 | record dropped               |
//! | `Update(o->a)`| TupleExists  | `Update(o -> new)`            | `Remove(o)`                  |
//! | `Remove(o)`   | `Update(o->v)`| TupleDoesNotExist            | TupleDoesNotExist            |
//!
//! A change that write-back already applied is marked unwritten again by any
//! later operation on its key. Removing a row the transaction inserted and
//! already wrote keeps an empty record, which the next write-back reverts.
//!
//! `update` and `remove` also fail with Conflict if `old` isn't the row the
//! transaction currently sees. A key that was never read counts as absent for
//! `update` and `remove`, and as absent for `insert` until write-back, where
//! the remote store has the final say.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

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
        Version,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::future;
use indexmap::IndexMap;
use value::{
    IndexKey,
    Schema,
    Tuple,
};

use crate::{
    future::{
        Future,
        Register,
    },
    indexes::{
        IndexIterator,
        Indexes,
    },
    metrics::{
        log_tuple_cache_hit,
        log_tuple_cache_miss,
        log_write_back_rows,
        write_back_timer,
    },
    transaction_cache::TransactionCache,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Remove,
}

/// The transaction's net effect on one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    /// The row before the transaction and the version it was read at.
    old: Option<(Tuple, Version)>,
    /// The row after the transaction. `None` if removed.
    new: Option<Tuple>,
    /// Whether write-back already applied this change remotely.
    written: bool,
}

impl Change {
    pub fn operation(&self) -> Operation {
        match (&self.old, &self.new) {
            (None, _) => Operation::Insert,
            (Some(_), Some(_)) => Operation::Update,
            (Some(_), None) => Operation::Remove,
        }
    }

    pub fn old_tuple(&self) -> Option<&Tuple> {
        self.old.as_ref().map(|(tuple, _)| tuple)
    }

    pub fn new_tuple(&self) -> Option<&Tuple> {
        self.new.as_ref()
    }

    /// Version the conditional write checks against.
    pub fn expected_version(&self) -> Option<Version> {
        self.old.as_ref().map(|(_, version)| *version)
    }

    pub fn is_written(&self) -> bool {
        self.written
    }
}

/// A row as read from the remote store.
#[derive(Clone, Debug)]
struct Fetched {
    tuple: Tuple,
    version: Version,
    is_newest: bool,
}

pub struct TableCache {
    table: TableMetadata,
    store: Arc<dyn RemoteStore>,
    snapshot: Snapshot,
    /// Remote reads, including keys known to be absent (`None`).
    fetched: BTreeMap<Key, Option<Fetched>>,
    changes: IndexMap<Key, Change>,
    indexes: Indexes,
}

async fn fetch(
    store: &Arc<dyn RemoteStore>,
    table: TableId,
    key: Key,
    snapshot: &Snapshot,
) -> anyhow::Result<Option<Fetched>> {
    match store.get(table, key, snapshot).await {
        Ok(row) => Ok(Some(Fetched {
            tuple: row.tuple,
            version: row.version,
            is_newest: row.is_newest,
        })),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("Failed to read key {key} of table {table}")))
        },
    }
}

fn row_error(error: ErrorMetadata) -> anyhow::Error {
    let error = anyhow::Error::new(error);
    error.report_custom_metric();
    error
}

impl TableCache {
    pub fn new(
        table: TableMetadata,
        store: Arc<dyn RemoteStore>,
        snapshot: Snapshot,
        indexes: Indexes,
    ) -> Self {
        Self {
            table,
            store,
            snapshot,
            fetched: BTreeMap::new(),
            changes: IndexMap::new(),
            indexes,
        }
    }

    pub fn id(&self) -> TableId {
        self.table.id
    }

    pub fn table(&self) -> &TableMetadata {
        &self.table
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.table.schema
    }

    /// Change records in the order their keys were first written.
    pub fn changes(&self) -> impl ExactSizeIterator<Item = (Key, &Change)> {
        self.changes.iter().map(|(key, change)| (*key, change))
    }

    pub fn change(&self, key: Key) -> Option<&Change> {
        self.changes.get(&key)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    /// The row the transaction sees at `key`, if it knows without asking the
    /// remote store.
    fn local_view(&self, key: Key) -> Option<anyhow::Result<Tuple>> {
        let found = match self.changes.get(&key) {
            Some(change) => change.new.clone(),
            None => self.fetched.get(&key)?.as_ref().map(|f| f.tuple.clone()),
        };
        Some(found.ok_or_else(|| row_error(ErrorMetadata::tuple_does_not_exist(key.into()))))
    }

    pub fn get(&self, key: Key) -> Future<Tuple> {
        if let Some(result) = self.local_view(key) {
            log_tuple_cache_hit();
            return match result {
                Ok(tuple) => Future::ready(tuple),
                Err(e) => Future::failed(e),
            };
        }
        log_tuple_cache_miss();
        tracing::debug!("Fetching key {key} of table {}", self.table.id);
        let store = self.store.clone();
        let snapshot = self.snapshot.clone();
        let table = self.table.id;
        Future::pending(async move {
            let fetched = fetch(&store, table, key, &snapshot).await?;
            let register: Register<Tuple> = Box::new(move |cache: &mut TransactionCache| {
                cache.table_mut(table)?.register_fetched(key, fetched)
            });
            Ok(register)
        })
    }

    /// Read `key` and wait for the result, for callers that own the cache.
    #[cfg(test)]
    pub(crate) async fn read(&mut self, key: Key) -> anyhow::Result<Tuple> {
        if let Some(result) = self.local_view(key) {
            return result;
        }
        let fetched = fetch(&self.store, self.table.id, key, &self.snapshot).await?;
        self.register_fetched(key, fetched)
    }

    /// Remember a remote read unless the transaction learned about the key in
    /// the meantime.
    fn register_fetched(&mut self, key: Key, fetched: Option<Fetched>) -> anyhow::Result<Tuple> {
        if !self.changes.contains_key(&key) {
            self.fetched.entry(key).or_insert(fetched);
        }
        self.local_view(key)
            .unwrap_or_else(|| Err(row_error(ErrorMetadata::tuple_does_not_exist(key.into()))))
    }

    fn check_schema(&self, tuple: &Tuple) -> anyhow::Result<()> {
        anyhow::ensure!(
            tuple.schema() == &self.table.schema,
            ErrorMetadata::bad_request(
                "WrongSchema",
                format!("Tuple does not match the schema of table {:?}", self.table.name),
            )
        );
        Ok(())
    }

    pub fn insert(&mut self, key: Key, tuple: Tuple) -> anyhow::Result<()> {
        self.check_schema(&tuple)?;
        match self.changes.get_mut(&key) {
            Some(Change { new: Some(_), .. }) => {
                return Err(row_error(ErrorMetadata::tuple_exists(key.into())));
            },
            Some(change) => {
                self.indexes.insert(key, &tuple);
                change.new = Some(tuple);
                change.written = false;
            },
            None => {
                if let Some(Some(_)) = self.fetched.get(&key) {
                    return Err(row_error(ErrorMetadata::tuple_exists(key.into())));
                }
                self.indexes.insert(key, &tuple);
                self.changes.insert(
                    key,
                    Change {
                        old: None,
                        new: Some(tuple),
                        written: false,
                    },
                );
            },
        }
        Ok(())
    }

    pub fn update(&mut self, key: Key, old: &Tuple, new: Tuple) -> anyhow::Result<()> {
        self.check_schema(&new)?;
        self.check_current(key, old)?;
        self.indexes.update(key, old, &new);
        match self.changes.get_mut(&key) {
            Some(change) => {
                change.new = Some(new);
                change.written = false;
            },
            None => {
                let original = self.original(key)?;
                self.changes.insert(
                    key,
                    Change {
                        old: Some(original),
                        new: Some(new),
                        written: false,
                    },
                );
            },
        }
        Ok(())
    }

    pub fn remove(&mut self, key: Key, old: &Tuple) -> anyhow::Result<()> {
        self.check_current(key, old)?;
        self.indexes.remove(key, old);
        match self.changes.get_mut(&key) {
            // Removing a row this transaction inserted leaves nothing to write.
            Some(Change {
                old: None,
                written: false,
                ..
            }) => {
                self.changes.shift_remove(&key);
            },
            Some(change) => {
                change.new = None;
                change.written = false;
            },
            None => {
                let original = self.original(key)?;
                self.changes.insert(
                    key,
                    Change {
                        old: Some(original),
                        new: None,
                        written: false,
                    },
                );
            },
        }
        Ok(())
    }

    /// Fail unless `old` is the live row the transaction sees at `key`. Rows
    /// read from the remote store must also be the newest version, or the
    /// write couldn't succeed.
    fn check_current(&self, key: Key, old: &Tuple) -> anyhow::Result<()> {
        let current = match self.changes.get(&key) {
            Some(change) => change.new.as_ref(),
            None => match self.fetched.get(&key) {
                Some(Some(fetched)) if !fetched.is_newest => {
                    return Err(row_error(ErrorMetadata::conflict(key.into())));
                },
                Some(Some(fetched)) => Some(&fetched.tuple),
                Some(None) | None => None,
            },
        };
        match current {
            None => Err(row_error(ErrorMetadata::tuple_does_not_exist(key.into()))),
            Some(current) if current != old => Err(row_error(ErrorMetadata::conflict(key.into()))),
            Some(_) => Ok(()),
        }
    }

    fn original(&self, key: Key) -> anyhow::Result<(Tuple, Version)> {
        match self.fetched.get(&key) {
            Some(Some(fetched)) => Ok((fetched.tuple.clone(), fetched.version)),
            _ => anyhow::bail!("Key {key} of table {} was never read", self.table.id),
        }
    }

    /// Apply every unwritten change with a conditional write. Changes that
    /// lose against a concurrent writer are reported together in one
    /// Conflict error; nothing is retried.
    pub async fn write_back(&mut self) -> anyhow::Result<()> {
        let timer = write_back_timer();
        let table = self.table.id;
        let writes = self
            .changes
            .iter()
            .filter(|(_, change)| !change.written)
            .map(|(key, change)| {
                let store = self.store.clone();
                let snapshot = &self.snapshot;
                let key = *key;
                async move {
                    let result = match (&change.old, &change.new) {
                        (None, Some(tuple)) => store.insert(table, key, snapshot, tuple.clone()).await,
                        (Some((_, version)), Some(tuple)) => {
                            store
                                .update(table, key, snapshot, *version, tuple.clone())
                                .await
                        },
                        (Some((_, version)), None) => store.remove(table, key, snapshot, *version).await,
                        // Inserted, written, then removed again.
                        (None, None) => store.revert(table, key, snapshot).await,
                    };
                    (key, result)
                }
            });
        let results = future::join_all(writes).await;
        log_write_back_rows(results.len());

        let mut conflicts = vec![];
        let mut fatal = None;
        for (key, result) in results {
            match result {
                Ok(()) => {
                    if let Some(change) = self.changes.get_mut(&key) {
                        change.written = true;
                    }
                },
                Err(StoreError::NotFound | StoreError::NotInSnapshot) => conflicts.push(key),
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(anyhow::Error::new(e).context(format!(
                            "Failed to write key {key} of table {}",
                            self.table.name
                        )));
                    }
                },
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        if !conflicts.is_empty() {
            tracing::debug!(
                "Write-back of table {} lost on keys {conflicts:?}",
                self.table.name
            );
            timer.finish_with("conflict");
            return Err(row_error(ErrorMetadata::conflicts(
                conflicts.into_iter().map(u64::from).collect(),
            )));
        }
        timer.finish();
        Ok(())
    }

    pub async fn write_indexes(&mut self) -> anyhow::Result<()> {
        self.indexes.write_back(&self.store, &self.snapshot).await
    }

    /// Forget the transaction's changes to this table. Anything write-back
    /// already applied remotely is reverted first. Remote reads stay cached.
    pub async fn rollback(&mut self) -> anyhow::Result<()> {
        let table = self.table.id;
        let reverts = self
            .changes
            .iter()
            .filter(|(_, change)| change.written)
            .map(|(key, _)| {
                let store = self.store.clone();
                let snapshot = &self.snapshot;
                let key = *key;
                async move { (key, store.revert(table, key, snapshot).await) }
            });
        for (key, result) in future::join_all(reverts).await {
            if let Err(e) = result {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to revert key {key} of table {}", self.table.name)));
            }
        }
        self.indexes.undo(&self.store, &self.snapshot).await?;
        self.changes.clear();
        self.indexes.clear();
        Ok(())
    }

    pub fn lower_bound(&self, index: &str, key: IndexKey) -> anyhow::Result<IndexIterator> {
        self.indexes
            .lower_bound(self.store.clone(), self.snapshot.clone(), index, key)
    }

    pub fn reverse_lower_bound(&self, index: &str, key: IndexKey) -> anyhow::Result<IndexIterator> {
        self.indexes
            .reverse_lower_bound(self.store.clone(), self.snapshot.clone(), index, key)
    }
}
