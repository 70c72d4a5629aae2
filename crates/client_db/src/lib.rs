//! Client-side transactions over a remote key/value store with optimistic
//! concurrency control. Reads are cached per transaction, writes are
//! buffered as change records and applied at commit with version-checked
//! conditional writes.

mod context;
mod future;
mod indexes;
mod metrics;
pub mod remote_counter;
mod table_cache;
mod transaction;
mod transaction_cache;
pub mod undo_log;

#[cfg(test)]
mod tests;

pub use context::{
    ClientTable,
    TransactionContext,
    CLIENTS_TABLE,
    TRANSACTIONS_TABLE_PREFIX,
    UNDO_LOG_FIELD,
};
pub use future::Future;
pub use indexes::{
    IndexIterator,
    IndexWrapper,
    Indexes,
};
pub use remote_counter::{
    CounterConfig,
    RemoteCounter,
};
pub use table_cache::{
    Change,
    Operation,
    TableCache,
};
pub use transaction::{
    Transaction,
    TransactionType,
};
pub use transaction_cache::TransactionCache;
pub use undo_log::UndoLog;
