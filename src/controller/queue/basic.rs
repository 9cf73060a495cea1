//! De-duplicating FIFO queue with delayed and rate-limited adds

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};

use super::rate_limit::ItemExponentialBackoff;
use super::WorkQueue;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: ItemExponentialBackoff<T>,
    /// Requests to the timer task, started on the first delayed add
    timer: OnceLock<mpsc::UnboundedSender<(T, Instant)>>,
    stop: CancellationToken,
}

impl<T: Hash + Eq + Clone> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }
}

impl<T: Hash + Eq + Clone + Send + Sync + 'static> Shared<T> {
    fn add_at(self: &Arc<Self>, item: T, deadline: Instant) {
        let timer = self.timer.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_timer(Arc::downgrade(self), rx, self.stop.clone()));
            tx
        });
        // Fails only after shutdown stopped the timer task
        let _ = timer.send((item, deadline));
    }
}

/// Hold delayed items until their deadline, then add them to the queue
///
/// Each item waits at most once; a second delayed add keeps the earlier
/// deadline.
async fn run_timer<T: Hash + Eq + Clone + Send + Sync + 'static>(
    shared: Weak<Shared<T>>,
    mut requests: mpsc::UnboundedReceiver<(T, Instant)>,
    stop: CancellationToken,
) {
    let mut delayed: DelayQueue<T> = DelayQueue::new();
    let mut waiting: HashMap<T, (delay_queue::Key, Instant)> = HashMap::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            request = requests.recv() => {
                let Some((item, deadline)) = request else {
                    return;
                };
                match waiting.get_mut(&item) {
                    Some((key, at)) => {
                        if deadline < *at {
                            delayed.reset_at(&*key, deadline);
                            *at = deadline;
                        }
                    }
                    None => {
                        let key = delayed.insert_at(item.clone(), deadline);
                        waiting.insert(item, (key, deadline));
                    }
                }
            }
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let item = expired.into_inner();
                let entry = waiting.remove_entry(&item);
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.add(item);
                drop(entry);
            }
        }
    }
}

/// Work queue with the usual controller semantics
///
/// * an item is queued at most once at a time
/// * an item is never handed to two workers at once; a re-add while it is
///   being processed is deferred until `done`
/// * delayed adds wait in one timer task; repeated delayed adds of the same
///   item keep a single, earliest deadline
pub struct BasicQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BasicQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Hash + Eq + Clone + Send + Sync + 'static> Default for BasicQueue<T> {
    fn default() -> Self {
        Self::new(ItemExponentialBackoff::default())
    }
}

impl<T: Hash + Eq + Clone + Send + Sync + 'static> BasicQueue<T> {
    pub fn new(limiter: ItemExponentialBackoff<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
                timer: OnceLock::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Number of items handed out and not yet marked done
    pub fn processing_len(&self) -> usize {
        self.shared.lock().processing.len()
    }
}

impl<T> fmt::Debug for BasicQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicQueue").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Hash + Eq + Clone + Send + Sync + 'static> WorkQueue<T> for BasicQueue<T> {
    fn add(&self, item: T) {
        self.shared.add(item);
    }

    fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.shared.add(item);
            return;
        }
        if self.shared.lock().shutting_down {
            return;
        }
        self.shared.add_at(item, Instant::now() + delay);
    }

    fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(item.clone());
        self.add_after(item, delay);
    }

    async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn done(&self, item: &T) {
        let released = {
            let mut state = self.shared.lock();
            let released = state.processing.take(item);
            if let Some(pending) = state.dirty.get(item).cloned() {
                state.queue.push_back(pending);
                drop(state);
                self.shared.notify.notify_one();
            }
            released
        };
        drop(released);
    }

    fn forget(&self, item: &T) {
        let forgotten = self.shared.limiter.forget(item);
        drop(forgotten);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.num_requeues(item)
    }

    fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    fn shut_down(&self) {
        let drained = {
            let mut state = self.shared.lock();
            state.shutting_down = true;
            state.dirty.clear();
            std::mem::take(&mut state.queue)
        };
        drop(drained);
        self.shared.stop.cancel();
        self.shared.notify.notify_waiters();
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let queue = BasicQueue::default();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_readd_while_processing_is_deferred_until_done() {
        let queue = BasicQueue::default();
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.processing_len(), 1);

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.processing_len(), 0);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_later() {
        let queue = BasicQueue::default();
        queue.add_after("a", Duration::from_secs(5));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_add_after_keeps_earliest_deadline() {
        let queue = BasicQueue::default();
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(2));
        queue.add_after("a", Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_delayed_items() {
        let queue = BasicQueue::default();
        let item = Arc::new(1);
        queue.add_after(item.clone(), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(Arc::strong_count(&item) > 1);

        queue.shut_down();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_adds_back_off() {
        let queue = BasicQueue::new(ItemExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
        ));
        queue.add_rate_limited("a");
        queue.add_rate_limited("b");
        assert_eq!(queue.num_requeues(&"a"), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.len(), 2);

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
        assert_eq!(queue.num_requeues(&"b"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_workers() {
        let queue: BasicQueue<&str> = BasicQueue::default();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("a");
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn test_waiting_workers_all_receive_items() {
        let queue: BasicQueue<u32> = BasicQueue::default();
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.add(1);
        queue.add(2);

        let mut got = Vec::new();
        for worker in workers {
            got.push(worker.await.unwrap().unwrap());
        }
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }
}
