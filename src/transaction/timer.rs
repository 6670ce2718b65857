use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

pub type TimerHandle = u64;

#[derive(Debug, PartialOrd, PartialEq, Eq, Clone)]
struct QueueKey {
    deadline: Instant,
    handle: TimerHandle,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.handle.cmp(&other.handle))
    }
}

/// Logical timer queue over the monotonic clock.
///
/// Entries are `(deadline, value)` pairs ordered in a BTreeMap; a
/// side map from handle to deadline makes `cancel` cheap. A periodic
/// driver calls [`TimerQueue::due`] and dispatches the expired
/// values. Holders keep the returned handle so state exits can clear
/// their timers.
pub struct TimerQueue<T> {
    entries: RwLock<BTreeMap<QueueKey, T>>,
    deadlines: RwLock<HashMap<TimerHandle, Instant>>,
    next_handle: AtomicU64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            entries: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule(&self, delay: Duration, value: T) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, value)
    }

    pub fn schedule_at(&self, deadline: Instant, value: T) -> TimerHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(QueueKey { deadline, handle }, value);
        }
        if let Ok(mut deadlines) = self.deadlines.write() {
            deadlines.insert(handle, deadline);
        }
        handle
    }

    pub fn cancel(&self, handle: TimerHandle) -> Option<T> {
        let deadline = self
            .deadlines
            .write()
            .ok()
            .and_then(|mut d| d.remove(&handle))?;
        self.entries
            .write()
            .ok()
            .and_then(|mut e| e.remove(&QueueKey { deadline, handle }))
    }

    /// Pop every entry whose deadline is at or before `now`.
    pub fn due(&self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        let expired_keys = {
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(_) => return fired,
            };
            let expired_keys: Vec<QueueKey> = entries
                .range(
                    ..=QueueKey {
                        deadline: now,
                        handle: u64::MAX,
                    },
                )
                .map(|(key, _)| key.clone())
                .collect();
            fired.reserve(expired_keys.len());
            for key in expired_keys.iter() {
                if let Some(value) = entries.remove(key) {
                    fired.push(value);
                }
            }
            expired_keys
        };
        if let Ok(mut deadlines) = self.deadlines.write() {
            for key in expired_keys {
                deadlines.remove(&key.handle);
            }
        }
        fired
    }
}
