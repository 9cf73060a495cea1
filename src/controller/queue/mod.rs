//! Work queue feeding reconcile workers
//!
//! [`WorkQueue`] is the queue primitive (de-duplication, delayed and
//! rate-limited adds). [`InstrumentedQueue`] decorates any implementation
//! with a side-table that remembers which correlation handle was active when
//! each item was enqueued, so a worker can continue the trace that caused it.

mod basic;
mod correlation;
mod instrumented;
mod rate_limit;

use std::time::Duration;

use async_trait::async_trait;

pub use basic::BasicQueue;
pub use correlation::{content_hash, Correlation, EventCorrelations};
pub use instrumented::{BoundQueue, InstrumentedQueue, ItemMeta, Tracked};
pub use rate_limit::ItemExponentialBackoff;

use crate::client::ObjectKey;

/// Queue of reconcile requests used by the controller runtime
pub type RequestQueue = InstrumentedQueue<ObjectKey, BasicQueue<Tracked<ObjectKey>>>;

/// Rate-limited, de-duplicating work queue
///
/// An item that is added while it is being processed is handed out again
/// only after `done` is called for it.
#[async_trait]
pub trait WorkQueue<T>: Send + Sync {
    fn add(&self, item: T);

    fn add_after(&self, item: T, delay: Duration);

    /// Add after the item's current rate-limit delay
    fn add_rate_limited(&self, item: T);

    /// Wait for the next item; `None` once the queue is shut down
    async fn get(&self) -> Option<T>;

    fn done(&self, item: &T);

    /// Reset the item's rate-limit history
    fn forget(&self, item: &T);

    fn num_requeues(&self, item: &T) -> u32;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shut_down(&self);

    fn is_shutting_down(&self) -> bool;
}
