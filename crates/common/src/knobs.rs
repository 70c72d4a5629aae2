//! Tunable limits and parameters for the transactional client.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so it can be adjusted safely.
//!
//! All knobs can be overridden with an environment variable of the same name.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Number of keys a counter reserves from the remote store per round trip.
/// Larger batches mean fewer round trips and bigger key-space gaps when a
/// client dies. Must be greater than `COUNTER_PREFETCH_THRESHOLD`.
pub static COUNTER_RESERVED_BATCH: LazyLock<u64> =
    LazyLock::new(|| env_config("COUNTER_RESERVED_BATCH", 1000));

/// When this many keys remain in a counter's current range, the next range is
/// requested in the background. Must be nonzero.
pub static COUNTER_PREFETCH_THRESHOLD: LazyLock<u64> =
    LazyLock::new(|| env_config("COUNTER_PREFETCH_THRESHOLD", 100));

/// How many times a counter batch request retries after losing a race on the
/// counter row before giving up.
pub static COUNTER_CONFLICT_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("COUNTER_CONFLICT_MAX_RETRIES", 100));

/// Initial backoff after a lost race on a counter row.
pub static COUNTER_CONFLICT_INITIAL_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("COUNTER_CONFLICT_INITIAL_BACKOFF_MS", 1))
});

/// Upper bound on the backoff between counter batch retries.
pub static COUNTER_CONFLICT_MAX_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("COUNTER_CONFLICT_MAX_BACKOFF_MS", 100))
});

/// Undo logs are split into rows of at most this many bytes before they are
/// written to the client's transaction table.
pub static UNDO_LOG_CHUNK_SIZE_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("UNDO_LOG_CHUNK_SIZE_BYTES", 16 * 1024));

/// Number of entries fetched per remote round trip while scanning an index.
pub static INDEX_SCAN_PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_SCAN_PAGE_SIZE", 128));

/// Attempts at registering a fresh random client id before the client gives
/// up on startup. Collisions are only possible between concurrently starting
/// clients, so a handful is plenty.
pub static CLIENT_REGISTRATION_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("CLIENT_REGISTRATION_MAX_ATTEMPTS", 16));
