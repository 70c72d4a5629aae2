use metrics::register_txn_counter;

register_txn_counter!(pub TUPLE_EXISTS_ERROR_TOTAL, "Count of inserts on keys that already exist");
register_txn_counter!(
    pub TUPLE_DOES_NOT_EXIST_ERROR_TOTAL,
    "Count of reads or writes on keys with no visible value"
);
register_txn_counter!(pub CONFLICT_ERROR_TOTAL, "Total count of optimistic concurrency conflicts");
register_txn_counter!(pub BAD_REQUEST_ERROR_TOTAL, "Count of bad request errors");
