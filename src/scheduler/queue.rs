use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

type Key = (DateTime<Utc>, u64);

#[derive(Debug)]
struct Inner<T> {
    entries: BTreeMap<Key, (String, T)>,
    by_name: HashMap<String, BTreeSet<Key>>,
    seq: u64,
}

/// Time-ordered set of pending runs.
///
/// The same name may be queued more than once; [`ScheduleQueue::remove`]
/// drops every entry for it.
#[derive(Debug)]
pub struct ScheduleQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for ScheduleQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScheduleQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                by_name: HashMap::new(),
                seq: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job` under `name` to fire at `at`.
    pub fn add_job(&self, at: DateTime<Utc>, name: impl Into<String>, job: T) {
        let name = name.into();
        let mut inner = self.lock();
        inner.seq += 1;
        let key = (at, inner.seq);
        inner.by_name.entry(name.clone()).or_default().insert(key);
        inner.entries.insert(key, (name, job));
    }

    /// Take one entry that is due now.
    pub fn pop(&self) -> Option<(String, T)> {
        self.pop_due(Utc::now())
    }

    /// Take the earliest entry due at or before `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<(String, T)> {
        let mut inner = self.lock();
        let key = *inner.entries.keys().next().filter(|key| key.0 <= now)?;
        let (name, job) = inner.entries.remove(&key)?;
        if let Some(keys) = inner.by_name.get_mut(&name) {
            keys.remove(&key);
            if keys.is_empty() {
                inner.by_name.remove(&name);
            }
        }
        Some((name, job))
    }

    /// Drop every entry for `name`. Returns whether anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let Some(keys) = inner.by_name.remove(name) else {
            return false;
        };
        for key in keys {
            inner.entries.remove(&key);
        }
        true
    }

    /// Next due time per queued name, earliest first.
    pub fn schedules(&self) -> Vec<(String, DateTime<Utc>)> {
        let inner = self.lock();
        let mut out: Vec<(String, DateTime<Utc>)> = inner
            .by_name
            .iter()
            .filter_map(|(name, keys)| keys.first().map(|(at, _)| (name.clone(), *at)))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Earliest due time queued for `name`.
    pub fn next_for(&self, name: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .by_name
            .get(name)
            .and_then(|keys| keys.first().map(|(at, _)| *at))
    }

    /// Returns the number of queued entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
