//! Interface to the remote key/value store.
//!
//! Every data operation is scoped to a `Snapshot`. Conditional writes are
//! checked against the version the caller last observed; losing that check
//! reports `StoreError::NotInSnapshot`.
use async_trait::async_trait;
use value::{
    IndexKey,
    Schema,
    Tuple,
};

use crate::{
    scan::ScanQuery,
    types::{
        Key,
        Snapshot,
        TableId,
        TableMetadata,
        Version,
    },
};

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The row, table or index has no visible value.
    #[error("Not found")]
    NotFound,
    /// A conditional write lost against a version outside the snapshot.
    #[error("Version is not in the snapshot")]
    NotInSnapshot,
    #[error("Invalid write: {0}")]
    InvalidWrite(String),
    #[error("Remote store error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A row as read from the store, with the version that wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedTuple {
    pub tuple: Tuple,
    pub version: Version,
    /// False if a newer version exists that this snapshot can't see. Writing
    /// the row would then fail, so callers can report the conflict early.
    pub is_newest: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum IndexOp {
    Insert,
    Remove,
}

impl IndexOp {
    pub fn inverse(self) -> Self {
        match self {
            IndexOp::Insert => IndexOp::Remove,
            IndexOp::Remove => IndexOp::Insert,
        }
    }
}

/// One pending change to a secondary index: add or drop the entry
/// `key -> value`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexMutation {
    pub key: IndexKey,
    pub value: Key,
    pub op: IndexOp,
}

impl IndexMutation {
    pub fn inverse(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value,
            op: self.op.inverse(),
        }
    }
}

/// The order to scan a range.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum Order {
    /// Ascending order, e.g. 1, 2, 3.
    Asc,
    /// Descending order, e.g. 3, 2, 1.
    Desc,
}

/// Where an index scan starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanStart {
    /// Every entry whose index key is at or past this key in scan order.
    Inclusive(IndexKey),
    /// Every entry strictly past this entry in scan order. Used to resume a
    /// paginated scan.
    After(IndexKey, Key),
}

impl ScanStart {
    /// Whether the entry `(key, value)` falls inside a scan in `order`
    /// starting here.
    pub fn admits(&self, order: Order, key: &IndexKey, value: Key) -> bool {
        match (self, order) {
            (ScanStart::Inclusive(start), Order::Asc) => key >= start,
            (ScanStart::Inclusive(start), Order::Desc) => key <= start,
            (ScanStart::After(start, start_value), Order::Asc) => {
                (key, value) > (start, *start_value)
            },
            (ScanStart::After(start, start_value), Order::Desc) => {
                (key, value) < (start, *start_value)
            },
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Issue a new snapshot. Its version is unique to the caller.
    async fn start_snapshot(&self) -> StoreResult<Snapshot>;

    /// Make every write stamped with the snapshot's version visible to
    /// snapshots issued afterwards.
    async fn commit(&self, snapshot: &Snapshot) -> StoreResult<()>;

    async fn get_table(&self, name: &str) -> StoreResult<TableMetadata>;

    /// Fails with `InvalidWrite` if a table of that name already exists.
    async fn create_table(&self, name: &str, schema: Schema) -> StoreResult<TableMetadata>;

    async fn get(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
    ) -> StoreResult<VersionedTuple>;

    /// Fails with `NotInSnapshot` if the key already holds a value, visible
    /// or not.
    async fn insert(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
        tuple: Tuple,
    ) -> StoreResult<()>;

    async fn update(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
        expected: Version,
        tuple: Tuple,
    ) -> StoreResult<()>;

    async fn remove(
        &self,
        table: TableId,
        key: Key,
        snapshot: &Snapshot,
        expected: Version,
    ) -> StoreResult<()>;

    /// Drop whatever the snapshot wrote to `key`. A no-op if it wrote nothing.
    async fn revert(&self, table: TableId, key: Key, snapshot: &Snapshot) -> StoreResult<()>;

    async fn create_index(&self, table: TableId, name: &str) -> StoreResult<()>;

    /// Fails with `NotFound` if the index doesn't exist.
    async fn open_index(&self, table: TableId, name: &str, snapshot: &Snapshot)
        -> StoreResult<()>;

    /// Up to `limit` visible entries of the index, in `order`, starting at
    /// `start`.
    async fn index_range(
        &self,
        table: TableId,
        name: &str,
        snapshot: &Snapshot,
        start: ScanStart,
        order: Order,
        limit: usize,
    ) -> StoreResult<Vec<(IndexKey, Key)>>;

    /// Apply mutations under the snapshot's version. Reapplying the same
    /// batch is a no-op.
    async fn write_index(
        &self,
        table: TableId,
        name: &str,
        snapshot: &Snapshot,
        mutations: Vec<IndexMutation>,
    ) -> StoreResult<()>;

    /// Evaluate `query` over the rows of its table visible in the snapshot,
    /// in key order. Fails with `NotFound` if the table doesn't exist.
    async fn scan(&self, snapshot: &Snapshot, query: &ScanQuery) -> StoreResult<Vec<Tuple>>;
}
