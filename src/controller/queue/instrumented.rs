//! Correlation-tracking decorator over a work queue
//!
//! Items enqueued through the decorator are wrapped in [`Tracked`] handles.
//! A side-table maps each item value to the correlation that was active when
//! it was first enqueued and to a weak reference to its handle. The entry
//! lives exactly as long as the item is in flight somewhere in the inner
//! queue (waiting, delayed, or being processed): when the last handle is
//! dropped the entry removes itself, and `done`/`forget` erase it eagerly.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;

use super::correlation::Correlation;
use super::WorkQueue;

struct Meta<T: Hash + Eq> {
    correlation: Option<Arc<Correlation>>,
    item: Weak<Slot<T>>,
}

type SideTable<T> = Mutex<HashMap<T, Meta<T>>>;

fn lock<T: Hash + Eq>(table: &SideTable<T>) -> MutexGuard<'_, HashMap<T, Meta<T>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot<T: Hash + Eq> {
    value: T,
    table: Weak<SideTable<T>>,
}

impl<T: Hash + Eq> Drop for Slot<T> {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = {
            let mut entries = lock(&table);
            let ours = entries
                .get(&self.value)
                .is_some_and(|meta| std::ptr::eq(meta.item.as_ptr(), self as *const Slot<T>));
            if ours {
                entries.remove(&self.value)
            } else {
                None
            }
        };
        drop(removed);
    }
}

/// Queue item wrapper carried by the inner queue
///
/// Compares and hashes by the wrapped value, so the inner queue de-duplicates
/// exactly as it would for bare items.
pub struct Tracked<T: Hash + Eq>(Arc<Slot<T>>);

impl<T: Hash + Eq> Tracked<T> {
    /// Lookup key with no side-table attachment
    fn probe(value: T) -> Self {
        Tracked(Arc::new(Slot {
            value,
            table: Weak::new(),
        }))
    }

    pub fn value(&self) -> &T {
        &self.0.value
    }
}

impl<T: Hash + Eq> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Tracked(self.0.clone())
    }
}

impl<T: Hash + Eq> PartialEq for Tracked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.value == other.0.value
    }
}

impl<T: Hash + Eq> Eq for Tracked<T> {}

impl<T: Hash + Eq> Hash for Tracked<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.value.hash(state);
    }
}

impl<T: Hash + Eq + fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&self.0.value).finish()
    }
}

/// Metadata recorded for an in-flight item
#[derive(Debug, Clone)]
pub struct ItemMeta {
    pub correlation: Option<Arc<Correlation>>,
}

/// Work queue that remembers the correlation each item was enqueued under
pub struct InstrumentedQueue<T: Hash + Eq, Q> {
    inner: Q,
    table: Arc<SideTable<T>>,
    default_correlation: Option<Arc<Correlation>>,
}

impl<T, Q> InstrumentedQueue<T, Q>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    Q: WorkQueue<Tracked<T>>,
{
    pub fn new(inner: Q) -> Self {
        Self {
            inner,
            table: Arc::new(Mutex::new(HashMap::new())),
            default_correlation: None,
        }
    }

    /// Correlation attached to items added without an explicit one
    pub fn with_default_correlation(mut self, correlation: Arc<Correlation>) -> Self {
        self.default_correlation = Some(correlation);
        self
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    /// Wrap an item, reusing the live handle if the item is already in flight
    fn track(&self, item: T, correlation: Option<&Arc<Correlation>>) -> Tracked<T> {
        let mut entries = lock(&self.table);
        if let Some(slot) = entries.get(&item).and_then(|meta| meta.item.upgrade()) {
            return Tracked(slot);
        }
        let slot = Arc::new(Slot {
            value: item.clone(),
            table: Arc::downgrade(&self.table),
        });
        let stale = entries.insert(
            item,
            Meta {
                correlation: correlation.cloned(),
                item: Arc::downgrade(&slot),
            },
        );
        drop(entries);
        drop(stale);
        Tracked(slot)
    }

    fn erase(&self, item: &T) {
        let removed = lock(&self.table).remove(item);
        drop(removed);
    }

    /// View that attaches `correlation` to every item added through it
    pub fn bind(&self, correlation: Arc<Correlation>) -> BoundQueue<'_, T, Q> {
        BoundQueue {
            queue: self,
            correlation,
        }
    }

    /// Metadata of an in-flight item
    ///
    /// `None` once the item was marked done or forgotten, or once no handle
    /// for it remains in the inner queue.
    pub fn get_meta_of(&self, item: &T) -> Option<ItemMeta> {
        let entries = lock(&self.table);
        let meta = entries.get(item)?;
        if meta.item.strong_count() == 0 {
            return None;
        }
        Some(ItemMeta {
            correlation: meta.correlation.clone(),
        })
    }

    /// Number of side-table entries
    pub fn tracked_len(&self) -> usize {
        lock(&self.table).len()
    }
}

#[async_trait]
impl<T, Q> WorkQueue<T> for InstrumentedQueue<T, Q>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    Q: WorkQueue<Tracked<T>>,
{
    fn add(&self, item: T) {
        let tracked = self.track(item, self.default_correlation.as_ref());
        self.inner.add(tracked);
    }

    fn add_after(&self, item: T, delay: Duration) {
        let tracked = self.track(item, self.default_correlation.as_ref());
        self.inner.add_after(tracked, delay);
    }

    fn add_rate_limited(&self, item: T) {
        let tracked = self.track(item, self.default_correlation.as_ref());
        self.inner.add_rate_limited(tracked);
    }

    async fn get(&self) -> Option<T> {
        let tracked = self.inner.get().await?;
        Some(tracked.value().clone())
    }

    fn done(&self, item: &T) {
        self.erase(item);
        self.inner.done(&Tracked::probe(item.clone()));
    }

    fn forget(&self, item: &T) {
        self.erase(item);
        self.inner.forget(&Tracked::probe(item.clone()));
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.inner.num_requeues(&Tracked::probe(item.clone()))
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn shut_down(&self) {
        self.inner.shut_down();
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }
}

/// Queue view bound to one correlation
///
/// Handed to event handlers for the duration of one invocation.
pub struct BoundQueue<'a, T: Hash + Eq, Q> {
    queue: &'a InstrumentedQueue<T, Q>,
    correlation: Arc<Correlation>,
}

impl<'a, T, Q> BoundQueue<'a, T, Q>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    Q: WorkQueue<Tracked<T>>,
{
    pub fn correlation(&self) -> &Arc<Correlation> {
        &self.correlation
    }

    pub fn add(&self, item: T) {
        let tracked = self.queue.track(item, Some(&self.correlation));
        self.queue.inner.add(tracked);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        let tracked = self.queue.track(item, Some(&self.correlation));
        self.queue.inner.add_after(tracked, delay);
    }

    pub fn add_rate_limited(&self, item: T) {
        let tracked = self.queue.track(item, Some(&self.correlation));
        self.queue.inner.add_rate_limited(tracked);
    }
}
