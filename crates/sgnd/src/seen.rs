//! Time-windowed LRU of recently processed CIDs
//!
//! Fast anti-replay shortcut consulted before the KU store on the publish
//! path. Entries expire after the window or when capacity pushes them out;
//! a miss means nothing (the store is authoritative), a hit means the CID
//! was processed recently.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct Inner {
    deadlines: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

/// Windowed LRU cache of CIDs
pub struct SeenCache {
    inner: Mutex<Inner>,
    cap: usize,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                deadlines: HashMap::new(),
                order: VecDeque::new(),
            }),
            cap,
            ttl,
        }
    }

    /// Has this CID been marked within the window?
    pub fn has_seen(&self, cid: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.deadlines.get(cid) {
            Some(deadline) if *deadline > now => true,
            Some(_) => {
                inner.deadlines.remove(cid);
                false
            }
            None => false,
        }
    }

    /// Record a CID; refreshes the window for already-present entries.
    pub fn mark_seen(&self, cid: &str) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let deadline = now + self.ttl;
        inner.deadlines.insert(cid.to_string(), deadline);
        inner.order.push_back((cid.to_string(), deadline));
        self.evict(&mut inner, now);
    }

    /// Entries currently tracked (expired ones may linger until touched)
    pub fn len(&self) -> usize {
        self.inner.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, inner: &mut Inner, now: Instant) {
        while let Some((cid, queued_deadline)) = inner.order.front().cloned() {
            let current = inner.deadlines.get(&cid).copied();
            match current {
                // Stale queue entry from a refresh; the live deadline is newer
                Some(live) if live != queued_deadline => {
                    inner.order.pop_front();
                }
                Some(live) if live <= now || inner.deadlines.len() > self.cap => {
                    inner.order.pop_front();
                    inner.deadlines.remove(&cid);
                }
                Some(_) => break,
                None => {
                    inner.order.pop_front();
                }
            }
        }
    }
}
