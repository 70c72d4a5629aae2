//! Client-wide state shared by every transaction: resolved tables, counters
//! and this client's registration with the remote store.
use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    knobs::CLIENT_REGISTRATION_MAX_ATTEMPTS,
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
use parking_lot::{
    Mutex,
    RwLock,
};
use rand::Rng;
use value::{
    FieldType,
    Schema,
    TableType,
    Tuple,
};

use crate::{
    metrics::{
        client_registration_timer,
        log_registered_tables,
    },
    remote_counter::{
        counter_table_name,
        CounterConfig,
        RemoteCounter,
    },
    transaction::{
        Transaction,
        TransactionType,
    },
};

pub const CLIENTS_TABLE: &str = "__clients";
pub const TRANSACTIONS_TABLE_PREFIX: &str = "__transactions_";
pub const UNDO_LOG_FIELD: &str = "undo_log";
const REGISTERED_FIELD: &str = "registered_at";

/// This client's row in `__clients` and its private undo log table.
#[derive(Clone, Debug)]
pub struct ClientTable {
    client_id: u64,
    clients: TableMetadata,
    transactions: TableMetadata,
}

impl ClientTable {
    /// Register a fresh client id and create its undo log table.
    pub async fn initialize(store: &Arc<dyn RemoteStore>) -> anyhow::Result<Self> {
        let _timer = client_registration_timer();
        let clients = Self::clients_table(store).await?;
        let client_id = Self::register(store, &clients).await?;

        let mut schema = Schema::new(TableType::Transactional);
        schema.add_field(FieldType::Blob, UNDO_LOG_FIELD, true)?;
        let name = format!("{TRANSACTIONS_TABLE_PREFIX}{client_id}");
        let transactions = store
            .create_table(&name, schema)
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("Failed to create {name:?}")))?;
        tracing::info!("Registered client {client_id}");
        Ok(Self {
            client_id,
            clients,
            transactions,
        })
    }

    async fn clients_table(store: &Arc<dyn RemoteStore>) -> anyhow::Result<TableMetadata> {
        match store.get_table(CLIENTS_TABLE).await {
            Ok(table) => return Ok(table),
            Err(StoreError::NotFound) => (),
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to open __clients")),
        }
        let mut schema = Schema::new(TableType::NonTransactional);
        schema.add_field(FieldType::BigInt, REGISTERED_FIELD, true)?;
        match store.create_table(CLIENTS_TABLE, schema).await {
            Ok(table) => Ok(table),
            // Another client created it first.
            Err(StoreError::InvalidWrite(_)) => Ok(store.get_table(CLIENTS_TABLE).await?),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to create __clients")),
        }
    }

    async fn register(
        store: &Arc<dyn RemoteStore>,
        clients: &TableMetadata,
    ) -> anyhow::Result<u64> {
        for _ in 0..*CLIENT_REGISTRATION_MAX_ATTEMPTS {
            // The top bit is left clear so ids print the same as i64.
            let client_id = rand::rng().random::<u64>() >> 1;
            let snapshot = store.start_snapshot().await?;
            let row = Tuple::new(clients.schema.clone())
                .with(REGISTERED_FIELD, u64::from(snapshot.version()) as i64)?;
            let result = store
                .insert(clients.id, Key::new(client_id), &snapshot, row)
                .await;
            store.commit(&snapshot).await?;
            match result {
                Ok(()) => return Ok(client_id),
                Err(StoreError::NotInSnapshot) => {
                    tracing::warn!("Client id {client_id} is taken, picking another");
                },
                Err(e) => {
                    return Err(anyhow::Error::new(e).context("Failed to register client id"));
                },
            }
        }
        anyhow::bail!(
            "Couldn't find a free client id after {} attempts",
            *CLIENT_REGISTRATION_MAX_ATTEMPTS
        )
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn clients(&self) -> &TableMetadata {
        &self.clients
    }

    /// Table holding this client's undo logs, one row per chunk.
    pub fn transactions(&self) -> &TableMetadata {
        &self.transactions
    }
}

/// Shared by every transaction of one client. Tables and counters resolved
/// by one transaction are visible to all later ones.
pub struct TransactionContext {
    store: Arc<dyn RemoteStore>,
    client: ClientTable,
    counter_config: CounterConfig,
    table_names: RwLock<HashMap<String, TableId>>,
    tables: RwLock<HashMap<TableId, TableMetadata>>,
    counters: Mutex<HashMap<String, Arc<RemoteCounter>>>,
}

impl TransactionContext {
    pub async fn initialize(store: Arc<dyn RemoteStore>) -> anyhow::Result<Arc<Self>> {
        Self::initialize_with_counter_config(store, CounterConfig::default()).await
    }

    pub async fn initialize_with_counter_config(
        store: Arc<dyn RemoteStore>,
        counter_config: CounterConfig,
    ) -> anyhow::Result<Arc<Self>> {
        counter_config.validate()?;
        let client = ClientTable::initialize(&store).await?;
        Ok(Arc::new(Self {
            store,
            client,
            counter_config,
            table_names: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }))
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn client(&self) -> &ClientTable {
        &self.client
    }

    pub async fn begin(
        self: &Arc<Self>,
        transaction_type: TransactionType,
    ) -> anyhow::Result<Transaction> {
        let snapshot = self
            .store
            .start_snapshot()
            .await
            .map_err(|e| anyhow::Error::new(e).context("Failed to start a snapshot"))?;
        Ok(Transaction::new(self.clone(), snapshot, transaction_type))
    }

    pub fn table_by_name(&self, name: &str) -> Option<TableMetadata> {
        let id = *self.table_names.read().get(name)?;
        self.tables.read().get(&id).cloned()
    }

    pub fn table(&self, id: TableId) -> Option<TableMetadata> {
        self.tables.read().get(&id).cloned()
    }

    /// Publish a table to every transaction. If it is already known, the
    /// published metadata wins and is returned.
    pub fn register_table(&self, table: TableMetadata) -> TableMetadata {
        let mut tables = self.tables.write();
        let table = tables.entry(table.id).or_insert(table).clone();
        log_registered_tables(tables.len());
        self.table_names
            .write()
            .entry(table.name.clone())
            .or_insert(table.id);
        tracing::info!("Registered table {:?} with id {}", table.name, table.id);
        table
    }

    /// Create the counter `name` and return a handle to it.
    pub async fn create_counter(&self, name: &str) -> anyhow::Result<Arc<RemoteCounter>> {
        value::check_valid_name(name)?;
        let table = RemoteCounter::create_table(&self.store, name).await?;
        self.register_counter(name, table)
    }

    /// Handle to the existing counter `name`. Every caller on this client
    /// shares one handle.
    pub async fn counter(&self, name: &str) -> anyhow::Result<Arc<RemoteCounter>> {
        let existing = self.counters.lock().get(name).cloned();
        if let Some(counter) = existing {
            return Ok(counter);
        }
        let table_name = counter_table_name(name);
        let table = match self.store.get_table(&table_name).await {
            Ok(table) => table,
            Err(StoreError::NotFound) => anyhow::bail!(ErrorMetadata::not_found(
                "CounterNotFound",
                format!("Counter {name:?} does not exist"),
            )),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to open counter {name:?}")))
            },
        };
        self.register_counter(name, table)
    }

    fn register_counter(
        &self,
        name: &str,
        table: TableMetadata,
    ) -> anyhow::Result<Arc<RemoteCounter>> {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get(name) {
            return Ok(counter.clone());
        }
        let counter = Arc::new(RemoteCounter::new(
            self.store.clone(),
            table,
            self.counter_config.clone(),
        )?);
        counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        store::{
            RemoteStore,
            StoreError,
        },
        testing::TestStore,
        types::{
            TableId,
            TableMetadata,
        },
    };
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use value::Schema;

    use super::{
        TransactionContext,
        CLIENTS_TABLE,
        TRANSACTIONS_TABLE_PREFIX,
    };

    #[tokio::test]
    async fn test_clients_register_distinct_ids() -> anyhow::Result<()> {
        let test_store = TestStore::new();
        let store: Arc<dyn RemoteStore> = Arc::new(test_store.clone());
        let first = TransactionContext::initialize(store.clone()).await?;
        let second = TransactionContext::initialize(store.clone()).await?;
        assert_ne!(first.client().client_id(), second.client().client_id());
        assert_eq!(first.client().clients().id, second.client().clients().id);
        assert_eq!(test_store.calls("create_table"), 3);

        let name = format!("{TRANSACTIONS_TABLE_PREFIX}{}", first.client().client_id());
        assert_eq!(store.get_table(&name).await?.id, first.client().transactions().id);
        assert!(store.get_table(CLIENTS_TABLE).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_registration_retries_taken_ids() -> anyhow::Result<()> {
        let test_store = TestStore::new();
        let store: Arc<dyn RemoteStore> = Arc::new(test_store.clone());
        test_store.fail_next("insert", StoreError::NotInSnapshot);
        TransactionContext::initialize(store).await?;
        assert_eq!(test_store.calls("insert"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_table_keeps_first() -> anyhow::Result<()> {
        let store: Arc<dyn RemoteStore> = Arc::new(TestStore::new());
        let context = TransactionContext::initialize(store).await?;
        let table = TableMetadata {
            id: TableId::new(100),
            name: "accounts".to_string(),
            schema: Arc::new(Schema::default()),
        };
        let first = context.register_table(table.clone());
        let renamed = TableMetadata {
            name: "renamed".to_string(),
            ..table.clone()
        };
        assert_eq!(context.register_table(renamed), first);
        assert_eq!(context.table_by_name("accounts"), Some(table.clone()));
        assert_eq!(context.table(TableId::new(100)), Some(table));
        assert_eq!(context.table_by_name("renamed"), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_counters_are_shared() -> anyhow::Result<()> {
        let store: Arc<dyn RemoteStore> = Arc::new(TestStore::new());
        let context = TransactionContext::initialize(store).await?;
        assert!(context.counter("orders").await.unwrap_err().is_not_found());
        let created = context.create_counter("orders").await?;
        let opened = context.counter("orders").await?;
        assert!(Arc::ptr_eq(&created, &opened));
        assert_eq!(opened.increment_and_get().await?, 1);
        assert!(context.create_counter("orders").await.unwrap_err().is_bad_request());
        Ok(())
    }
}
