use super::metrics::{PipelineMetrics, PipelineMetricsSnapshot, PipelineMetricsSource};
use crate::config::PipelineConfig;
use crate::core::Result;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A unit of push work addressed by `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskItem<K, P> {
    pub key: K,
    pub payload: P,
    pub enqueued_at: Instant,
}

impl<K, P> TaskItem<K, P> {
    pub fn new(key: K, payload: P) -> Self {
        Self {
            key,
            payload,
            enqueued_at: Instant::now(),
        }
    }
}

/// What happened to a submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted as a new pending entry.
    Accepted,
    /// Replaced the pending entry with the same key in place.
    Overridden,
    /// Dropped because the buffer was full.
    Overflowed,
}

/// Per-call breakdown of a [`TaskAdmissionQueue::replay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub requeued: usize,
    pub expired: usize,
    pub overridden: usize,
    pub overflowed: usize,
}

struct Slot<P> {
    seq: i64,
    payload: P,
    enqueued_at: Instant,
}

/// Pending items keyed by task key and ordered by sequence number.
///
/// New items take increasing sequence numbers at the back, replayed items take
/// decreasing negative numbers at the front.
struct BufferState<K, P> {
    slots: HashMap<K, Slot<P>>,
    order: BTreeMap<i64, K>,
    next_back: i64,
    next_front: i64,
    /// Lower bound on the earliest expiry among pending items.
    next_expiry: Option<Instant>,
}

impl<K: Eq + Hash + Clone, P> BufferState<K, P> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_back: 0,
            next_front: -1,
            next_expiry: None,
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Lowers the expiry bound to cover an item enqueued at `enqueued_at`.
    fn track_expiry(&mut self, enqueued_at: Instant, max_age: Option<Duration>) {
        if let Some(expires_at) = max_age.and_then(|age| enqueued_at.checked_add(age)) {
            self.next_expiry = Some(match self.next_expiry {
                Some(current) => current.min(expires_at),
                None => expires_at,
            });
        }
    }

    fn insert(&mut self, seq: i64, item: TaskItem<K, P>, max_age: Option<Duration>) {
        self.track_expiry(item.enqueued_at, max_age);
        self.order.insert(seq, item.key.clone());
        self.slots.insert(
            item.key,
            Slot {
                seq,
                payload: item.payload,
                enqueued_at: item.enqueued_at,
            },
        );
    }

    fn push_back(&mut self, item: TaskItem<K, P>, max_age: Option<Duration>) {
        let seq = self.next_back;
        self.next_back += 1;
        self.insert(seq, item, max_age);
    }

    fn push_front(&mut self, item: TaskItem<K, P>, max_age: Option<Duration>) {
        let seq = self.next_front;
        self.next_front -= 1;
        self.insert(seq, item, max_age);
    }

    fn pop_front(&mut self) -> Option<TaskItem<K, P>> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some(TaskItem {
            key,
            payload: slot.payload,
            enqueued_at: slot.enqueued_at,
        })
    }

    /// Removes every item older than `max_age`. Only scans once the earliest possible
    /// expiry has passed.
    fn evict_expired(&mut self, now: Instant, max_age: Duration) -> usize {
        match self.next_expiry {
            Some(next_expiry) if now > next_expiry => {}
            _ => return 0,
        }

        let expired = self
            .slots
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.enqueued_at) > max_age)
            .map(|(key, slot)| (key.clone(), slot.seq))
            .collect::<Vec<_>>();
        for (key, seq) in &expired {
            self.slots.remove(key);
            self.order.remove(seq);
        }

        self.next_expiry = self
            .slots
            .values()
            .filter_map(|slot| slot.enqueued_at.checked_add(max_age))
            .min();
        expired.len()
    }
}

/// Bounded, key-addressable buffer of pending push work.
///
/// Any number of producers may `submit` while one consumer drains. A single mutex covers
/// the buffer; every operation is O(log n) apart from the expiry sweep, which only runs
/// once something can have expired.
///
/// Overflow never blocks or errors: a submission that finds the buffer full is dropped
/// and counted.
pub struct TaskAdmissionQueue<K, P> {
    name: String,
    capacity: usize,
    max_age: Option<Duration>,
    buffer: Mutex<BufferState<K, P>>,
    metrics: Arc<PipelineMetrics>,
}

impl<K, P> TaskAdmissionQueue<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            capacity: config.capacity,
            max_age: config.max_age(),
            buffer: Mutex::new(BufferState::new()),
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().slots.contains_key(key)
    }

    /// Pending keys in drain order.
    pub fn pending_keys(&self) -> Vec<K> {
        self.lock().order.values().cloned().collect()
    }

    // Operations never leave the buffer half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BufferState<K, P>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, state: &mut BufferState<K, P>, now: Instant) {
        if let Some(max_age) = self.max_age {
            let evicted = state.evict_expired(now, max_age);
            if evicted > 0 {
                self.metrics.record_expired(evicted);
                self.metrics.set_pending(state.len());
            }
        }
    }

    pub fn submit(&self, key: K, payload: P) -> Admission {
        self.submit_item(TaskItem::new(key, payload))
    }

    /// Admits `item`, merging it into a pending item with the same key if there is one.
    pub fn submit_item(&self, item: TaskItem<K, P>) -> Admission {
        let mut state = self.lock();
        self.expire(&mut state, Instant::now());

        if let Some(slot) = state.slots.get_mut(&item.key) {
            slot.payload = item.payload;
            slot.enqueued_at = item.enqueued_at;
            // the replacement may carry an older stamp than anything tracked so far
            state.track_expiry(item.enqueued_at, self.max_age);
            self.metrics.record_overridden();
            return Admission::Overridden;
        }

        if state.len() >= self.capacity {
            self.metrics.record_overflowed(1);
            return Admission::Overflowed;
        }

        state.push_back(item, self.max_age);
        self.metrics.record_accepted();
        self.metrics.set_pending(state.len());
        Admission::Accepted
    }

    /// Removes up to `max_items` of the oldest pending items.
    ///
    /// Items past max age are evicted first and counted as expired, never returned.
    pub fn drain_batch(&self, max_items: usize) -> Vec<TaskItem<K, P>> {
        let mut state = self.lock();
        self.expire(&mut state, Instant::now());

        let mut batch = Vec::with_capacity(max_items.min(state.len()));
        while batch.len() < max_items {
            match state.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        if !batch.is_empty() {
            self.metrics.set_pending(state.len());
        }
        batch
    }

    /// Puts drained-but-undelivered items back at the front, keeping their order.
    ///
    /// Items past max age count as expired; items whose key has a newer pending entry
    /// count as overridden and are dropped in its favor; items that find the buffer full
    /// count as overflowed.
    pub fn replay(&self, items: Vec<TaskItem<K, P>>) -> ReplayOutcome {
        let mut outcome = ReplayOutcome::default();
        if items.is_empty() {
            return outcome;
        }
        self.metrics.record_replayed(items.len());

        let now = Instant::now();
        let mut state = self.lock();
        self.expire(&mut state, now);

        // back to front, so the first item ends up first in line
        for item in items.into_iter().rev() {
            let too_old = self
                .max_age
                .is_some_and(|age| now.saturating_duration_since(item.enqueued_at) > age);
            if too_old {
                outcome.expired += 1;
            } else if state.slots.contains_key(&item.key) {
                outcome.overridden += 1;
            } else if state.len() >= self.capacity {
                outcome.overflowed += 1;
            } else {
                state.push_front(item, self.max_age);
                outcome.requeued += 1;
            }
        }

        self.metrics.record_expired(outcome.expired);
        self.metrics.record_overflowed(outcome.overflowed);
        for _ in 0..outcome.overridden {
            self.metrics.record_overridden();
        }
        self.metrics.set_pending(state.len());
        outcome
    }
}

impl<K, P> PipelineMetricsSource for TaskAdmissionQueue<K, P>
where
    K: Eq + Hash + Clone + Send,
    P: Send,
{
    fn pipeline_name(&self) -> &str {
        &self.name
    }

    fn metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        self.metrics.snapshot(&self.name, self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> TaskAdmissionQueue<&'static str, u32> {
        TaskAdmissionQueue::new(&PipelineConfig::new("test").capacity(capacity)).unwrap()
    }

    fn aging_queue(capacity: usize, max_age_ms: u64) -> TaskAdmissionQueue<&'static str, u32> {
        TaskAdmissionQueue::new(
            &PipelineConfig::new("aging")
                .capacity(capacity)
                .max_age_ms(max_age_ms),
        )
        .unwrap()
    }

    #[test]
    fn test_capacity_override_and_drain_scenario() {
        let queue = queue(2);
        assert_eq!(queue.submit("A", 1), Admission::Accepted);
        assert_eq!(queue.submit("B", 1), Admission::Accepted);
        assert_eq!(queue.submit("C", 1), Admission::Overflowed);

        let metrics = queue.metrics();
        assert_eq!(queue.pending_keys(), vec!["A", "B"]);
        assert_eq!(metrics.overflowed(), 1);
        assert_eq!(metrics.pending(), 2);

        assert_eq!(queue.submit("B", 2), Admission::Overridden);
        assert_eq!(metrics.overridden(), 1);
        assert_eq!(metrics.pending(), 2);

        let batch = queue.drain_batch(2);
        let drained = batch
            .iter()
            .map(|item| (item.key, item.payload))
            .collect::<Vec<_>>();
        assert_eq!(drained, vec![("A", 1), ("B", 2)]);
        assert_eq!(metrics.pending(), 0);
        assert_eq!(metrics.accepted(), 2);
        assert_eq!(metrics.max_buffer_seen(), 2);
        assert!(!queue.contains(&"C"));
    }

    #[test]
    fn test_drain_respects_limit() {
        let queue = queue(10);
        for key in ["a", "b", "c", "d", "e"] {
            queue.submit(key, 0);
        }

        let first = queue.drain_batch(3);
        assert_eq!(first.len(), 3);
        assert_eq!(queue.metrics().pending(), 2);
        assert_eq!(queue.len(), 2);

        let rest = queue.drain_batch(3);
        assert_eq!(
            rest.iter().map(|item| item.key).collect::<Vec<_>>(),
            vec!["d", "e"]
        );
        assert!(queue.drain_batch(3).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_override_keeps_position() {
        let queue = queue(10);
        queue.submit("a", 1);
        queue.submit("b", 1);
        queue.submit("a", 2);

        assert_eq!(queue.pending_keys(), vec!["a", "b"]);
        assert_eq!(queue.drain_batch(1)[0].payload, 2);
    }

    #[test]
    fn test_overflow_after_drain_makes_room() {
        let queue = queue(1);
        queue.submit("a", 1);
        assert_eq!(queue.submit("b", 1), Admission::Overflowed);
        queue.drain_batch(1);
        assert_eq!(queue.submit("b", 1), Admission::Accepted);
        assert_eq!(queue.metrics().overflowed(), 1);
    }

    #[test]
    fn test_replay_goes_to_front_in_order() {
        let queue = queue(10);
        queue.submit("a", 1);
        queue.submit("b", 1);
        let batch = queue.drain_batch(2);
        queue.submit("c", 1);

        let outcome = queue.replay(batch);
        assert_eq!(outcome.requeued, 2);
        assert_eq!(queue.pending_keys(), vec!["a", "b", "c"]);
        assert_eq!(queue.metrics().replayed(), 2);
        assert_eq!(queue.metrics().pending(), 3);
    }

    #[test]
    fn test_replay_drops_superseded_and_overflowing_items() {
        let queue = queue(2);
        queue.submit("a", 1);
        queue.submit("b", 1);
        let batch = queue.drain_batch(2);

        queue.submit("a", 2);
        queue.submit("z", 1);

        let outcome = queue.replay(batch);
        assert_eq!(
            outcome,
            ReplayOutcome {
                requeued: 0,
                expired: 0,
                overridden: 1,
                overflowed: 1,
            }
        );
        assert_eq!(queue.pending_keys(), vec!["a", "z"]);
        assert_eq!(queue.drain_batch(1)[0].payload, 2);
        assert_eq!(queue.metrics().overridden(), 1);
        assert_eq!(queue.metrics().overflowed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_items_make_room_on_submit() {
        let queue = aging_queue(2, 100);
        queue.submit("a", 1);
        queue.submit("b", 1);

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(queue.submit("c", 1), Admission::Accepted);

        assert_eq!(queue.metrics().expired(), 2);
        assert_eq!(queue.metrics().overflowed(), 0);
        assert_eq!(queue.pending_keys(), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_items_survive_sweep() {
        let queue = aging_queue(10, 100);
        queue.submit("old", 1);
        tokio::time::advance(Duration::from_millis(60)).await;
        queue.submit("new", 1);
        tokio::time::advance(Duration::from_millis(60)).await;

        let batch = queue.drain_batch(10);
        assert_eq!(
            batch.iter().map(|item| item.key).collect::<Vec<_>>(),
            vec!["new"]
        );
        assert_eq!(queue.metrics().expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_refreshes_age() {
        let queue = aging_queue(10, 100);
        queue.submit("a", 1);
        tokio::time::advance(Duration::from_millis(80)).await;
        queue.submit("a", 2);
        tokio::time::advance(Duration::from_millis(80)).await;

        let batch = queue.drain_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, 2);
        assert_eq!(queue.metrics().expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_with_older_stamp_still_expires() {
        let queue = aging_queue(10, 100);
        queue.submit("a", 1);

        let backdated = Instant::now() - Duration::from_millis(50);
        let item = TaskItem {
            key: "a",
            payload: 2,
            enqueued_at: backdated,
        };
        assert_eq!(queue.submit_item(item), Admission::Overridden);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(queue.drain_batch(10).is_empty());
        assert_eq!(queue.metrics().expired(), 1);
        assert_eq!(queue.metrics().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_of_stale_items_counts_expired() {
        let queue = aging_queue(10, 100);
        queue.submit("a", 1);
        let batch = queue.drain_batch(1);

        tokio::time::advance(Duration::from_millis(150)).await;
        let outcome = queue.replay(batch);
        assert_eq!(outcome.expired, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.metrics().expired(), 1);
        assert_eq!(queue.metrics().replayed(), 1);
    }

    #[test]
    fn test_concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(
            TaskAdmissionQueue::<u32, u32>::new(&PipelineConfig::new("concurrent").capacity(64))
                .unwrap(),
        );

        let handles = (0..8u32)
            .map(|producer| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for n in 0..100u32 {
                        queue.submit(producer * 1_000 + n, n);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = queue.metrics();
        assert_eq!(queue.len(), 64);
        assert_eq!(metrics.max_buffer_seen(), 64);
        assert_eq!(metrics.accepted() + metrics.overflowed(), 800);
    }
}
