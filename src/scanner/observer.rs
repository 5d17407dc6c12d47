//! Subscribers to scan results

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

use super::types::ExtractResult;
use crate::error::Result;

/// Receives every extraction result a scanner produces
#[async_trait]
pub trait Observer: Send + Sync {
    /// Errors are logged by the caller and never stop delivery
    async fn on_extract_result(&self, result: &ExtractResult) -> Result<()>;
}

/// Token returned by [`ObserverRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// Ordered set of observers
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverHandle, Arc<dyn Observer>)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle, observer));
        handle
    }

    /// Returns false when the handle was not subscribed
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `result` to every observer in subscription order.
    ///
    /// Returns the number of observers that accepted it.
    pub async fn notify(&self, result: &ExtractResult) -> usize {
        let snapshot: Vec<(ObserverHandle, Arc<dyn Observer>)> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut accepted = 0;
        for (handle, observer) in snapshot {
            match AssertUnwindSafe(observer.on_extract_result(result))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(e)) => error!(
                    "Observer {:?} failed on {} tx {}: {}",
                    handle, result.symbol, result.tx_id, e
                ),
                Err(_) => error!(
                    "Observer {:?} panicked on {} tx {}",
                    handle, result.symbol, result.tx_id
                ),
            }
        }

        debug!(
            "Delivered {} tx {} to {} observers",
            result.symbol, result.tx_id, accepted
        );
        accepted
    }
}
