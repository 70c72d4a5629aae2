//! Handles for reads that may need a remote round trip.
//!
//! A remote request is issued as soon as the `Future` is created and runs on
//! its own tokio task. Whatever the transaction learns from it (a fetched
//! tuple, a newly resolved table) is only added to the transaction cache when
//! the caller collects the result with [`Future::get`].
use tokio::task::JoinHandle;

use crate::transaction_cache::TransactionCache;

/// Applies a completed remote response to the transaction cache and produces
/// the caller's value.
pub(crate) type Register<T> =
    Box<dyn FnOnce(&mut TransactionCache) -> anyhow::Result<T> + Send + 'static>;

pub struct Future<T> {
    state: FutureState<T>,
}

enum FutureState<T> {
    Ready(anyhow::Result<T>),
    Pending(JoinHandle<anyhow::Result<Register<T>>>),
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn ready(value: T) -> Self {
        Self {
            state: FutureState::Ready(Ok(value)),
        }
    }

    pub(crate) fn failed(error: anyhow::Error) -> Self {
        Self {
            state: FutureState::Ready(Err(error)),
        }
    }

    /// Spawn `request` now. Must be called from within a tokio runtime.
    pub(crate) fn pending<F>(request: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<Register<T>>> + Send + 'static,
    {
        Self {
            state: FutureState::Pending(tokio::spawn(request)),
        }
    }

    /// Whether `get` can return without waiting on the remote store.
    pub fn is_ready(&self) -> bool {
        match &self.state {
            FutureState::Ready(_) => true,
            FutureState::Pending(handle) => handle.is_finished(),
        }
    }

    /// Wait for the result and register it with the transaction that issued
    /// the request.
    pub async fn get(self, cache: &mut impl AsMut<TransactionCache>) -> anyhow::Result<T> {
        match self.state {
            FutureState::Ready(result) => result,
            FutureState::Pending(handle) => {
                let register = handle.await??;
                register(cache.as_mut())
            },
        }
    }
}
