use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    /// Unique within the queue (SKU or URL).
    pub key: String,
    /// Lower is served sooner.
    pub priority: u32,
    pub payload: T,
    pub enqueued_at: Instant,
    pub attempts: u32,
    seq: u64,
}

impl<T> WorkItem<T> {
    pub fn new(key: impl Into<String>, priority: u32, payload: T) -> Self {
        Self {
            key: key.into(),
            priority,
            payload,
            enqueued_at: Instant::now(),
            attempts: 0,
            seq: 0,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: &'static str,
    pub queued: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub expired: u64,
}

struct QueueState<T> {
    order: BTreeMap<(u32, u64), String>,
    items: HashMap<String, WorkItem<T>>,
    in_flight: HashSet<String>,
    next_seq: u64,
}

impl<T> QueueState<T> {
    fn insert(&mut self, mut item: WorkItem<T>, keep_seq: bool) {
        if !keep_seq {
            item.seq = self.next_seq;
            self.next_seq += 1;
        }
        self.order.insert((item.priority, item.seq), item.key.clone());
        self.items.insert(item.key.clone(), item);
    }

    fn take(&mut self, key: &str) -> Option<WorkItem<T>> {
        let item = self.items.remove(key)?;
        self.order.remove(&(item.priority, item.seq));
        Some(item)
    }
}

/// Bounded, de-duplicating priority queue.
///
/// Pop order is by priority, then insertion order. A key is either queued or
/// in flight, never both, and a key that is either is rejected by `push`.
pub struct WorkQueue<T> {
    name: &'static str,
    capacity: usize,
    ttl: Duration,
    state: Mutex<QueueState<T>>,
    expired: AtomicU64,
}

impl<T> WorkQueue<T> {
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            capacity,
            ttl,
            state: Mutex::new(QueueState {
                order: BTreeMap::new(),
                items: HashMap::new(),
                in_flight: HashSet::new(),
                next_seq: 0,
            }),
            expired: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false without queueing when the key is already queued or in
    /// flight, or when the queue is full.
    pub fn push(&self, mut item: WorkItem<T>) -> bool {
        let mut st = self.lock();
        if st.items.contains_key(&item.key) || st.in_flight.contains(&item.key) {
            debug!(queue = self.name, key = %item.key, "Duplicate work item ignored");
            return false;
        }
        if st.items.len() >= self.capacity {
            warn!(queue = self.name, key = %item.key, capacity = self.capacity, "Queue full, rejecting item");
            return false;
        }
        item.enqueued_at = Instant::now();
        st.insert(item, false);
        true
    }

    /// Takes the lowest-priority item and marks its key in flight.
    pub fn pop(&self) -> Option<WorkItem<T>> {
        let mut st = self.lock();
        let (_, key) = st.order.pop_first()?;
        let item = st.items.remove(&key)?;
        st.in_flight.insert(key);
        Some(item)
    }

    /// Like `pop`, but skips items `ready` rejects. Skipped items keep their
    /// place.
    pub fn pop_ready<F>(&self, mut ready: F) -> Option<WorkItem<T>>
    where
        F: FnMut(&WorkItem<T>) -> bool,
    {
        let mut st = self.lock();
        let key = st
            .order
            .values()
            .find(|k| st.items.get(k.as_str()).map_or(false, &mut ready))
            .cloned()?;
        let item = st.take(&key)?;
        st.in_flight.insert(key);
        Some(item)
    }

    /// Puts an in-flight (or queued) item back under a new priority. Resets
    /// its age and counts the attempt. Never rejected for capacity, so a
    /// re-scheduled item cannot be lost to newer arrivals.
    pub fn requeue(&self, mut item: WorkItem<T>, new_priority: u32) {
        let mut st = self.lock();
        st.in_flight.remove(&item.key);
        st.take(&item.key);
        item.priority = new_priority;
        item.attempts += 1;
        item.enqueued_at = Instant::now();
        st.insert(item, false);
    }

    /// Returns an in-flight item unchanged, keeping its original place.
    pub fn release(&self, item: WorkItem<T>) {
        let mut st = self.lock();
        st.in_flight.remove(&item.key);
        if st.items.contains_key(&item.key) {
            return;
        }
        st.insert(item, true);
    }

    /// Marks an in-flight key as done.
    pub fn complete(&self, key: &str) -> bool {
        self.lock().in_flight.remove(key)
    }

    /// Forgets a key whether queued or in flight.
    pub fn remove(&self, key: &str) -> bool {
        let mut st = self.lock();
        let was_flight = st.in_flight.remove(key);
        st.take(key).is_some() || was_flight
    }

    pub fn contains(&self, key: &str) -> bool {
        let st = self.lock();
        st.items.contains_key(key) || st.in_flight.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep_expired(&self) -> Vec<WorkItem<T>> {
        self.sweep_expired_at(Instant::now())
    }

    /// Drops queued items older than the TTL, logging each one.
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<WorkItem<T>> {
        let mut st = self.lock();
        let stale: Vec<String> = st
            .items
            .values()
            .filter(|i| i.age(now) > self.ttl)
            .map(|i| i.key.clone())
            .collect();

        let mut dropped = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(item) = st.take(&key) {
                warn!(
                    queue = self.name,
                    key = %item.key,
                    age_secs = item.age(now).as_secs(),
                    attempts = item.attempts,
                    "Dropping expired work item"
                );
                dropped.push(item);
            }
        }
        self.expired.fetch_add(dropped.len() as u64, Ordering::Relaxed);
        dropped
    }

    /// Empties the queue in pop order. In-flight markers are cleared too.
    pub fn drain_all(&self) -> Vec<WorkItem<T>> {
        let mut st = self.lock();
        let order = std::mem::take(&mut st.order);
        st.in_flight.clear();
        order
            .into_values()
            .filter_map(|key| st.items.remove(&key))
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.lock();
        QueueStats {
            name: self.name,
            queued: st.items.len(),
            in_flight: st.in_flight.len(),
            capacity: self.capacity,
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
