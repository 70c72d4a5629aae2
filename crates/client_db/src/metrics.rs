use metrics::{
    log_counter,
    log_counter_with_tags,
    log_distribution,
    log_gauge,
    metric_tag_const_value,
    register_txn_counter,
    register_txn_gauge,
    register_txn_histogram,
    StatusTimer,
    Timer,
    STATUS_LABEL,
};

register_txn_histogram!(
    CLIENT_DB_COMMIT_SECONDS,
    "Time to write back and commit a transaction",
    &STATUS_LABEL
);
pub fn commit_timer() -> StatusTimer {
    StatusTimer::new(&CLIENT_DB_COMMIT_SECONDS)
}

register_txn_histogram!(
    CLIENT_DB_WRITE_BACK_SECONDS,
    "Time to apply one table's change records to the remote store",
    &STATUS_LABEL
);
pub fn write_back_timer() -> StatusTimer {
    StatusTimer::new(&CLIENT_DB_WRITE_BACK_SECONDS)
}

register_txn_histogram!(
    CLIENT_DB_WRITE_BACK_ROWS,
    "Number of change records written back per table"
);
pub fn log_write_back_rows(num_rows: usize) {
    log_distribution(&CLIENT_DB_WRITE_BACK_ROWS, num_rows as f64);
}

register_txn_histogram!(
    CLIENT_DB_SCAN_SECONDS,
    "Time to run an analytical scan",
    &STATUS_LABEL
);
pub fn scan_timer() -> StatusTimer {
    StatusTimer::new(&CLIENT_DB_SCAN_SECONDS)
}

register_txn_histogram!(CLIENT_DB_SCAN_ROWS, "Number of rows returned per scan");
pub fn log_scan_rows(num_rows: usize) {
    log_distribution(&CLIENT_DB_SCAN_ROWS, num_rows as f64);
}

register_txn_counter!(
    CLIENT_DB_ROLLBACK_TOTAL,
    "Number of rolled back transactions"
);
pub fn log_rollback() {
    log_counter(&CLIENT_DB_ROLLBACK_TOTAL, 1);
}

register_txn_counter!(
    CLIENT_DB_UNFINISHED_TRANSACTIONS_TOTAL,
    "Transactions dropped without commit or rollback"
);
pub fn log_unfinished_transaction() {
    log_counter(&CLIENT_DB_UNFINISHED_TRANSACTIONS_TOTAL, 1);
}

register_txn_counter!(
    CLIENT_DB_TUPLE_CACHE_HITS,
    "Tuple reads served by the transaction cache"
);
register_txn_counter!(
    CLIENT_DB_TUPLE_CACHE_MISSES,
    "Tuple reads that went to the remote store"
);
pub fn log_tuple_cache_hit() {
    log_counter(&CLIENT_DB_TUPLE_CACHE_HITS, 1);
}
pub fn log_tuple_cache_miss() {
    log_counter(&CLIENT_DB_TUPLE_CACHE_MISSES, 1);
}

register_txn_counter!(
    CLIENT_DB_INDEX_SCAN_REQUESTS,
    "Index pages fetched from the remote store"
);
pub fn log_index_page_fetch() {
    log_counter(&CLIENT_DB_INDEX_SCAN_REQUESTS, 1);
}

register_txn_histogram!(
    CLIENT_DB_INDEX_WRITE_KEYS,
    "Number of index entries flushed per index write"
);
pub fn log_index_write_keys(num_keys: usize) {
    log_distribution(&CLIENT_DB_INDEX_WRITE_KEYS, num_keys as f64);
}

register_txn_histogram!(CLIENT_DB_UNDO_LOG_BYTES, "Size of encoded undo logs");
register_txn_histogram!(
    CLIENT_DB_UNDO_LOG_CHUNKS,
    "Number of rows an undo log is split into"
);
pub fn log_undo_log(num_bytes: usize, num_chunks: usize) {
    log_distribution(&CLIENT_DB_UNDO_LOG_BYTES, num_bytes as f64);
    log_distribution(&CLIENT_DB_UNDO_LOG_CHUNKS, num_chunks as f64);
}

register_txn_histogram!(
    COUNTER_BATCH_REQUEST_SECONDS,
    "Time to reserve a batch of keys from a remote counter",
    &STATUS_LABEL
);
pub fn counter_batch_timer() -> StatusTimer {
    StatusTimer::new(&COUNTER_BATCH_REQUEST_SECONDS)
}

register_txn_counter!(
    COUNTER_CONFLICT_RETRIES,
    "Counter batch requests retried after losing a race on the counter row"
);
pub fn log_counter_conflict_retry() {
    log_counter(&COUNTER_CONFLICT_RETRIES, 1);
}

register_txn_counter!(
    COUNTER_WAITS,
    "Counter increments that waited for a batch request",
    &["prefetched"]
);
pub fn log_counter_wait(prefetch_in_flight: bool) {
    let value = if prefetch_in_flight { "true" } else { "false" };
    log_counter_with_tags(
        &COUNTER_WAITS,
        1,
        vec![metric_tag_const_value("prefetched", value)],
    );
}

register_txn_histogram!(
    CLIENT_REGISTRATION_SECONDS,
    "Time to register a client id and create its undo log table"
);
pub fn client_registration_timer() -> Timer {
    Timer::new(&CLIENT_REGISTRATION_SECONDS)
}

register_txn_gauge!(
    CLIENT_DB_REGISTERED_TABLES,
    "Tables known to the client's transaction context"
);
pub fn log_registered_tables(num_tables: usize) {
    log_gauge(&CLIENT_DB_REGISTERED_TABLES, num_tables as f64);
}
