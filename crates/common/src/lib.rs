//! Types shared by every layer of the transactional client: ids, snapshots,
//! the `RemoteStore` interface and the knobs that tune the client.
pub mod backoff;
pub mod knobs;
pub mod scan;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
