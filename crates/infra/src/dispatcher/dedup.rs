use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use jobsweep_core::EventId;

/// Bounded memory of fully resolved event ids.
///
/// Lets the dispatcher acknowledge an exact redelivery without running the
/// handlers again. Oldest ids are evicted first; an evicted id simply gets
/// handled again, which handlers tolerate.
#[derive(Debug)]
pub struct SeenEvents {
    capacity: usize,
    inner: Mutex<SeenInner>,
}

#[derive(Debug, Default)]
struct SeenInner {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(SeenInner::default()),
        }
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.ids.contains(&id))
            .unwrap_or(false)
    }

    pub fn insert(&self, id: EventId) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.ids.insert(id) {
            return;
        }
        inner.order.push_back(id);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.ids.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
