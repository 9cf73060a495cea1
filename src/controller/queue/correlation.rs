//! Correlation handles linking change notifications to reconciles

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use sha2::{Digest, Sha256};
use tracing::{info_span, Span};
use uuid::Uuid;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Trace context captured when work was caused
///
/// Shared by every queue item enqueued under it. Registered release callbacks
/// run once the last holder drops it.
pub struct Correlation {
    id: Uuid,
    span: Span,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Correlation {
    pub fn new(span: Span) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            span,
            cleanups: Mutex::new(Vec::new()),
        })
    }

    /// Correlation for work not caused by a change notification
    pub fn detached(origin: &str) -> Arc<Self> {
        let id = Uuid::new_v4();
        let span = info_span!("enqueue", origin = %origin, correlation_id = %id);
        Arc::new(Self {
            id,
            span,
            cleanups: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `f` when this correlation is released
    pub fn on_release(&self, f: impl FnOnce() + Send + 'static) {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }
}

impl Drop for Correlation {
    fn drop(&mut self) {
        let cleanups = std::mem::take(
            self.cleanups
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for cleanup in cleanups {
            cleanup();
        }
    }
}

impl fmt::Debug for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlation")
            .field("id", &self.id)
            .field("span", &self.span.id())
            .finish()
    }
}

/// Hex SHA-256 of a serialized notification
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

type Entries = Mutex<HashMap<String, Weak<Correlation>>>;

/// Maps notification content to the correlation created for it
///
/// Identical notifications delivered to several handlers resolve to the same
/// handle while any of them is alive. Entries hold weak references and are
/// removed when their correlation is released.
#[derive(Default)]
pub struct EventCorrelations {
    entries: Arc<Entries>,
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Weak<Correlation>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventCorrelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live correlation for this notification or start a new one
    pub fn resolve(&self, notification: &[u8]) -> Arc<Correlation> {
        let hash = content_hash(notification);
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(&hash).and_then(Weak::upgrade) {
            return existing;
        }

        let id = Uuid::new_v4();
        let span = info_span!(
            "change_notification",
            correlation_id = %id,
            content_hash = %&hash[..12],
        );
        let correlation = Arc::new(Correlation {
            id,
            span,
            cleanups: Mutex::new(Vec::new()),
        });
        entries.insert(hash.clone(), Arc::downgrade(&correlation));
        drop(entries);

        let table = Arc::downgrade(&self.entries);
        let ptr = Arc::as_ptr(&correlation) as usize;
        correlation.on_release(move || {
            let Some(table) = table.upgrade() else {
                return;
            };
            let mut entries = lock(&table);
            let ours = entries
                .get(&hash)
                .is_some_and(|w| w.as_ptr() as usize == ptr);
            if ours {
                entries.remove(&hash);
            }
        });
        correlation
    }

    /// Look up a live correlation by content hash
    pub fn lookup(&self, hash: &str) -> Option<Arc<Correlation>> {
        lock(&self.entries).get(hash).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_identical_notifications_share_a_handle() {
        let cache = EventCorrelations::new();
        let a = cache.resolve(b"event-1");
        let b = cache.resolve(b"event-1");
        let c = cache.resolve(b"event-2");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_entry_removed_on_release() {
        let cache = EventCorrelations::new();
        let handle = cache.resolve(b"event-1");
        let hash = content_hash(b"event-1");
        assert!(cache.lookup(&hash).is_some());

        drop(handle);
        assert!(cache.lookup(&hash).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_resolve_after_release_creates_new_handle() {
        let cache = EventCorrelations::new();
        let first_id = cache.resolve(b"event-1").id();
        let second = cache.resolve(b"event-1");
        assert_ne!(first_id, second.id());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_release_callbacks_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let correlation = Correlation::detached("test");
        let observed = count.clone();
        correlation.on_release(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let other = correlation.clone();

        drop(correlation);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(other);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
