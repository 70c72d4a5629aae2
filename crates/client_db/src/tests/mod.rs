use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    scan::{
        AggregationType,
        Conjunct,
        PredicateType,
        ScanQuery,
    },
    store::{
        RemoteStore,
        StoreError,
    },
    testing::TestStore,
    types::{
        Key,
        TableId,
    },
};
use errors::ErrorMetadataAnyhowExt;
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
    undo_log::chunk_key,
    Transaction,
    TransactionContext,
    TransactionType,
    UndoLog,
};

fn accounts_schema() -> anyhow::Result<Schema> {
    let mut schema = Schema::new(TableType::Transactional);
    let balance = schema.add_field(FieldType::BigInt, "balance", true)?;
    schema.add_field(FieldType::Text, "owner", false)?;
    schema.add_index("by_balance", vec![balance])?;
    Ok(schema)
}

fn account(schema: &Arc<Schema>, balance: i64) -> Tuple {
    Tuple::new(schema.clone())
        .with("balance", balance)
        .expect("balance is a BIGINT")
}

fn balance_key(balance: i64) -> IndexKey {
    IndexKey::new(&[Field::BigInt(balance)])
}

async fn new_client() -> anyhow::Result<(TestStore, Arc<TransactionContext>)> {
    let test_store = TestStore::new();
    let store: Arc<dyn RemoteStore> = Arc::new(test_store.clone());
    let context = TransactionContext::initialize(store).await?;
    Ok((test_store, context))
}

/// Create `accounts` and commit the given rows.
async fn create_accounts(
    context: &Arc<TransactionContext>,
    rows: &[(u64, i64)],
) -> anyhow::Result<(TableId, Arc<Schema>)> {
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    let table = txn.create_table("accounts", accounts_schema()?).await?;
    let schema = txn.schema(table)?;
    for (key, balance) in rows {
        txn.insert(table, Key::new(*key), account(&schema, *balance))?;
    }
    txn.commit().await?;
    Ok((table, schema))
}

/// Open `accounts` in a transaction that didn't create it.
async fn open_accounts(txn: &mut Transaction) -> anyhow::Result<TableId> {
    let opened = txn.open_table("accounts").await;
    opened.get(txn).await
}

async fn create_accounts_client() -> anyhow::Result<(TestStore, Arc<TransactionContext>)> {
    let (test_store, context) = new_client().await?;
    create_accounts(&context, &[]).await?;
    Ok((test_store, context))
}

#[tokio::test]
async fn test_accounts_end_to_end() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    let table = txn.create_table("accounts", accounts_schema()?).await?;
    let row = account(&txn.schema(table)?, 100);
    txn.insert(table, Key::new(1), row.clone())?;
    txn.write_back(true).await?;
    txn.commit().await?;

    // A second client knows nothing about the table yet.
    let store: Arc<dyn RemoteStore> = Arc::new(test_store.clone());
    let other = TransactionContext::initialize(store).await?;
    let mut txn = other.begin(TransactionType::ReadOnly).await?;
    let opened = txn.open_table("accounts").await;
    assert!(!opened.is_ready());
    let id = opened.get(&mut txn).await?;
    assert_eq!(id, table);
    assert_eq!(txn.read(id, Key::new(1)).await?, row);
    assert_eq!(
        txn.read(id, Key::new(1)).await?.get_by_name("balance"),
        Some(&Field::BigInt(100))
    );
    txn.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_open_table_twice_is_local() -> anyhow::Result<()> {
    let (test_store, writer) = create_accounts_client().await?;
    let store: Arc<dyn RemoteStore> = Arc::new(test_store.clone());
    let context = TransactionContext::initialize(store).await?;
    drop(writer);

    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    let before = test_store.calls("get_table");
    let first = open_accounts(&mut txn).await?;
    assert_eq!(test_store.calls("get_table"), before + 1);

    let second = txn.open_table("accounts").await;
    assert!(second.is_ready());
    assert_eq!(second.get(&mut txn).await?, first);
    assert_eq!(test_store.calls("get_table"), before + 1);

    // Later transactions of the same client skip the name lookup too, and
    // can use the table as soon as `open_table` returns.
    let mut next = context.begin(TransactionType::ReadWrite).await?;
    let opened = next.open_table("accounts").await;
    assert!(opened.is_ready());
    assert!(next.as_mut().table(first).is_ok());
    assert_eq!(opened.get(&mut next).await?, first);
    assert_eq!(test_store.calls("get_table"), before + 1);

    txn.rollback().await?;
    next.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_open_missing_table() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    let err = txn.open_table("nope").await.get(&mut txn).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.short_msg(), "TableNotFound");

    txn.create_table("accounts", accounts_schema()?).await?;
    let err = txn
        .create_table("accounts", accounts_schema()?)
        .await
        .unwrap_err();
    assert!(err.is_bad_request());
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_insert_then_get_is_local() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(7), account(&schema, 5))?;

    let gets = test_store.calls("get");
    let future = txn.get(table, Key::new(7))?;
    assert!(future.is_ready());
    assert_eq!(future.get(&mut txn).await?, account(&schema, 5));
    assert_eq!(test_store.calls("get"), gets);
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_remote_reads_are_cached() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10)]).await?;
    let mut txn = context.begin(TransactionType::ReadOnly).await?;
    open_accounts(&mut txn).await?;

    let gets = test_store.calls("get");
    assert_eq!(txn.read(table, Key::new(1)).await?, account(&schema, 10));
    assert!(txn
        .read(table, Key::new(2))
        .await
        .unwrap_err()
        .is_tuple_does_not_exist());
    assert_eq!(test_store.calls("get"), gets + 2);

    // Both the hit and the miss are remembered.
    assert_eq!(txn.read(table, Key::new(1)).await?, account(&schema, 10));
    assert!(txn.read(table, Key::new(2)).await.is_err());
    assert_eq!(test_store.calls("get"), gets + 2);
    txn.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_insert_remove_rollback_leaves_store_untouched() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10)]).await?;
    let rows_before = test_store.row_history(table, Key::new(1));
    let entries_before = test_store.index_entries(table, "by_balance");

    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(2), account(&schema, 20))?;
    txn.remove(table, Key::new(2), &account(&schema, 20))?;
    let old = txn.read(table, Key::new(1)).await?;
    txn.update(table, Key::new(1), &old, account(&schema, 11))?;
    txn.insert(table, Key::new(3), account(&schema, 30))?;
    // Push everything to the store before giving up.
    txn.write_back(true).await?;
    assert_eq!(test_store.index_entries(table, "by_balance").len(), 2);
    txn.rollback().await?;

    assert_eq!(test_store.row_history(table, Key::new(1)), rows_before);
    assert_eq!(test_store.row_history(table, Key::new(2)), vec![]);
    assert_eq!(test_store.row_history(table, Key::new(3)), vec![]);
    assert_eq!(test_store.index_entries(table, "by_balance"), entries_before);

    let mut reader = context.begin(TransactionType::ReadOnly).await?;
    open_accounts(&mut reader).await?;
    assert_eq!(reader.read(table, Key::new(1)).await?, account(&schema, 10));
    reader.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_stale_update_conflicts() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10)]).await?;

    let mut first = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut first).await?;
    let mut late = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut late).await?;
    let old = first.read(table, Key::new(1)).await?;

    // Passing a value the transaction never saw is refused outright.
    let err = first
        .update(table, Key::new(1), &account(&schema, 99), account(&schema, 0))
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.offending_keys(), &[1]);

    let mut second = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut second).await?;
    let current = second.read(table, Key::new(1)).await?;
    second.update(table, Key::new(1), &current, account(&schema, 20))?;
    second.commit().await?;

    // `first` read before the concurrent commit, so only write-back notices.
    first.update(table, Key::new(1), &old, account(&schema, 30))?;
    let err = first.commit().await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.offending_keys(), &[1]);
    first.rollback().await?;

    // `late` reads the old row after the concurrent commit and fails early.
    let stale = late.read(table, Key::new(1)).await?;
    assert_eq!(stale, account(&schema, 10));
    let err = late
        .update(table, Key::new(1), &stale, account(&schema, 40))
        .unwrap_err();
    assert!(err.is_conflict());
    late.rollback().await?;

    let mut reader = context.begin(TransactionType::ReadOnly).await?;
    open_accounts(&mut reader).await?;
    assert_eq!(reader.read(table, Key::new(1)).await?, account(&schema, 20));
    reader.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_rollback_after_partial_write_back() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (accounts, schema) = create_accounts(&context, &[(1, 10)]).await?;
    let mut setup = context.begin(TransactionType::ReadWrite).await?;
    let mut ledger_schema = Schema::new(TableType::Transactional);
    ledger_schema.add_field(FieldType::BigInt, "amount", true)?;
    let ledger = setup.create_table("ledger", ledger_schema).await?;
    let ledger_schema = setup.schema(ledger)?;
    setup.commit().await?;

    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.open_table("ledger").await.get(&mut txn).await?;
    let old = txn.read(accounts, Key::new(1)).await?;
    txn.update(accounts, Key::new(1), &old, account(&schema, 0))?;
    let entry = Tuple::new(ledger_schema.clone()).with("amount", 10i64)?;
    txn.insert(ledger, Key::new(1), entry.clone())?;

    // Another client claims the ledger key first.
    let store: Arc<dyn RemoteStore> = Arc::new(test_store.clone());
    let concurrent = store.start_snapshot().await?;
    store
        .insert(ledger, Key::new(1), &concurrent, entry)
        .await?;

    let err = txn.commit().await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.offending_keys(), &[1]);
    // The accounts row was written before the ledger failed.
    assert_eq!(test_store.row_history(accounts, Key::new(1)).len(), 2);

    txn.rollback().await?;
    assert_eq!(test_store.row_history(accounts, Key::new(1)).len(), 1);
    let mut reader = context.begin(TransactionType::ReadOnly).await?;
    open_accounts(&mut reader).await?;
    assert_eq!(reader.read(accounts, Key::new(1)).await?, account(&schema, 10));
    reader.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_undo_log_matches_changes() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10)]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(3), account(&schema, 30))?;
    txn.insert(table, Key::new(2), account(&schema, 20))?;
    let old = txn.read(table, Key::new(1)).await?;
    txn.remove(table, Key::new(1), &old)?;

    let (len, bytes) = txn.as_mut().undo_log(false);
    assert_eq!(len, bytes.len());
    let log = UndoLog::decode(&bytes)?;
    assert!(!log.with_indexes);
    assert_eq!(log.tables.len(), 1);
    assert_eq!(log.tables[0].table, table);
    assert_eq!(
        log.tables[0].keys,
        vec![Key::new(3), Key::new(2), Key::new(1)]
    );
    assert!(log.tables[0].indexes.is_empty());

    let (len, bytes) = txn.as_mut().undo_log(true);
    assert_eq!(len, bytes.len());
    let log = UndoLog::decode(&bytes)?;
    assert!(log.with_indexes);
    let indexes = &log.tables[0].indexes;
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].name, "by_balance");
    let entries: Vec<_> = indexes[0]
        .entries
        .iter()
        .map(|entry| (entry.key.clone(), entry.value))
        .collect();
    assert_eq!(
        entries,
        vec![
            (balance_key(10), Key::new(1)),
            (balance_key(20), Key::new(2)),
            (balance_key(30), Key::new(3)),
        ]
    );
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_undo_log_is_persisted_then_removed() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;
    let transactions = context.client().transactions().id;

    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    let version = txn.snapshot().version();
    txn.insert(table, Key::new(1), account(&schema, 1))?;
    let inserts = test_store.calls("insert");
    txn.commit().await?;

    // One undo chunk plus the row itself.
    assert_eq!(test_store.calls("insert"), inserts + 2);
    assert_eq!(
        test_store.row_history(transactions, chunk_key(version, 0)),
        vec![]
    );
    Ok(())
}

#[tokio::test]
async fn test_undo_log_failure_writes_nothing() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(1), account(&schema, 1))?;
    test_store.fail_next("insert", StoreError::Other("disk full".to_string()));

    let err = txn.commit().await.unwrap_err();
    assert!(format!("{err:#}").contains("undo log"));
    assert_eq!(test_store.row_history(table, Key::new(1)), vec![]);
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_index_scan_sees_own_writes() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10), (2, 30), (4, 50)]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(3), account(&schema, 20))?;
    let old = txn.read(table, Key::new(2)).await?;
    txn.remove(table, Key::new(2), &old)?;
    let old = txn.read(table, Key::new(4)).await?;
    txn.update(table, Key::new(4), &old, account(&schema, 5))?;

    let mut scan = txn.lower_bound(table, "by_balance", balance_key(i64::MIN))?;
    let mut keys = vec![];
    while let Some(key) = scan.next().await? {
        keys.push(u64::from(key));
    }
    assert_eq!(keys, vec![4, 1, 3]);

    let mut scan = txn.reverse_lower_bound(table, "by_balance", balance_key(15))?;
    let mut keys = vec![];
    while let Some(key) = scan.next().await? {
        keys.push(u64::from(key));
    }
    assert_eq!(keys, vec![1, 4]);

    assert!(txn
        .lower_bound(table, "by_owner", balance_key(0))
        .is_err());
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_read_only_transactions_refuse_writes() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;
    for transaction_type in [TransactionType::ReadOnly, TransactionType::Analytical] {
        let mut txn = context.begin(transaction_type).await?;
        open_accounts(&mut txn).await?;
        txn.insert(table, Key::new(1), account(&schema, 1))?;
        let err = txn.commit().await.unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.short_msg(), "ReadOnlyTransaction");
        txn.rollback().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_finished_transactions_refuse_work() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(1), account(&schema, 1))?;
    txn.commit().await?;
    assert!(txn.write_back(true).await.is_err());
    assert!(txn.rollback().await.is_err());

    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    txn.rollback().await?;
    assert!(txn.commit().await.is_err());
    // A second rollback is a no-op.
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_insert_values() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;

    fn values(pairs: &[(&str, Field)]) -> HashMap<String, Field> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
    let err = txn
        .insert_values(table, Key::new(1), values(&[("owner", Field::from("ann"))]))
        .unwrap_err();
    assert_eq!(err.short_msg(), "FieldNotSet");
    let err = txn
        .insert_values(table, Key::new(1), values(&[("balance", Field::from("ten"))]))
        .unwrap_err();
    assert_eq!(err.short_msg(), "WrongFieldType");
    let err = txn
        .insert_values(
            table,
            Key::new(1),
            values(&[("balance", Field::BigInt(1)), ("color", Field::from("red"))]),
        )
        .unwrap_err();
    assert!(err.is_bad_request());
    assert_eq!(err.short_msg(), "FieldDoesNotExist");
    assert!(!txn.as_mut().has_changes());

    txn.insert_values(
        table,
        Key::new(1),
        values(&[("balance", Field::BigInt(1)), ("owner", Field::from("ann"))]),
    )?;
    let expected = account(&schema, 1).with("owner", "ann")?;
    assert_eq!(txn.read(table, Key::new(1)).await?, expected);
    assert_eq!(txn.new_tuple(table)?, Tuple::new(schema));
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_counter_starts_at_one() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    let counter = txn.create_counter("orders").await?;
    assert_eq!(counter.increment_and_get().await?, 1);
    assert_eq!(counter.increment_and_get().await?, 2);
    let shared = txn.get_counter("orders").await?;
    assert_eq!(shared.increment_and_get().await?, 3);
    assert!(txn.get_counter("invoices").await.unwrap_err().is_not_found());
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_tables_must_be_opened_per_transaction() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10)]).await?;
    let mut txn = context.begin(TransactionType::ReadWrite).await?;

    // The schema is known to the client before the table is opened.
    assert_eq!(txn.schema(table)?, schema);
    assert_eq!(txn.new_tuple(table)?, Tuple::new(schema.clone()));
    assert!(txn.read(table, Key::new(1)).await.is_err());
    assert!(txn.insert(table, Key::new(2), account(&schema, 2)).is_err());

    assert_eq!(open_accounts(&mut txn).await?, table);
    assert_eq!(txn.read(table, Key::new(1)).await?, account(&schema, 10));
    let err = txn.schema(TableId::new(999)).unwrap_err();
    assert_eq!(err.short_msg(), "TableNotFound");
    txn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_changes_after_write_back_are_committed() -> anyhow::Result<()> {
    let (test_store, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[]).await?;

    let mut txn = context.begin(TransactionType::ReadWrite).await?;
    open_accounts(&mut txn).await?;
    txn.insert(table, Key::new(1), account(&schema, 100))?;
    txn.write_back(false).await?;
    txn.update(table, Key::new(1), &account(&schema, 100), account(&schema, 200))?;
    txn.insert(table, Key::new(2), account(&schema, 7))?;
    txn.write_back(true).await?;
    txn.remove(table, Key::new(2), &account(&schema, 7))?;
    txn.commit().await?;

    let mut reader = context.begin(TransactionType::ReadOnly).await?;
    open_accounts(&mut reader).await?;
    assert_eq!(reader.read(table, Key::new(1)).await?, account(&schema, 200));
    assert!(reader
        .read(table, Key::new(2))
        .await
        .unwrap_err()
        .is_tuple_does_not_exist());
    reader.commit().await?;
    assert_eq!(test_store.row_history(table, Key::new(2)), vec![]);
    assert_eq!(
        test_store.index_entries(table, "by_balance"),
        vec![(balance_key(200), Key::new(1))]
    );
    Ok(())
}

#[tokio::test]
async fn test_analytical_scan() -> anyhow::Result<()> {
    let (_, context) = new_client().await?;
    let (table, schema) = create_accounts(&context, &[(1, 10), (2, 30), (3, 50)]).await?;
    let balance = schema.id_of("balance").expect("balance column");

    let mut writer = context.begin(TransactionType::ReadWrite).await?;
    let query = ScanQuery::full(table);
    let err = writer.scan(&query).await.unwrap_err();
    assert_eq!(err.short_msg(), "ScanRequiresAnalytical");
    open_accounts(&mut writer).await?;
    writer.insert(table, Key::new(4), account(&schema, 70))?;
    writer.commit().await?;

    let mut txn = context.begin(TransactionType::Analytical).await?;
    let query = ScanQuery::full(table)
        .and(Conjunct::new().or(PredicateType::Greater, balance, Field::BigInt(20)));
    assert_eq!(
        txn.scan(&query).await?,
        vec![account(&schema, 30), account(&schema, 50), account(&schema, 70)]
    );
    let query = ScanQuery::aggregation(
        table,
        vec![(AggregationType::Sum, balance), (AggregationType::Max, balance)],
    );
    let totals = txn.scan(&query).await?;
    assert_eq!(totals[0].fields(), &[Field::BigInt(160), Field::BigInt(70)]);

    let bad = ScanQuery::full(table)
        .and(Conjunct::new().or(PredicateType::Equal, balance, Field::from("ten")));
    assert_eq!(txn.scan(&bad).await.unwrap_err().short_msg(), "WrongFieldType");
    txn.commit().await?;
    Ok(())
}
