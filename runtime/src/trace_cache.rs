// trace_cache.rs — At-most-once tracing per cache key
//
// `get_or_trace` returns the value published under a key, or claims the key
// and runs the trace. Other callers asking for a claimed key block until the
// claim is published or abandoned. A failed or panicking trace abandons its
// claim: nothing is published and the next caller traces again.
//
// Preconditions: `trace` does not ask the same cache for the key it is tracing.
// Postconditions: every caller that gets `Ok` for a key gets the same `Arc`.
// Failure modes: the trace's own error; `InvalidArgument` when a trace
//                re-enters its own key on the same thread.
// Side effects: none beyond the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};
use crate::fingerprint::CacheKey;

enum Slot<V> {
    Tracing(ThreadId),
    Ready(Arc<V>),
}

pub struct TraceCache<V> {
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
    published: Condvar,
    traces: AtomicUsize,
}

impl<V> Default for TraceCache<V> {
    fn default() -> Self {
        TraceCache {
            slots: Mutex::new(HashMap::new()),
            published: Condvar::new(),
            traces: AtomicUsize::new(0),
        }
    }
}

impl<V> TraceCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_trace<F>(&self, key: &CacheKey, trace: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let me = thread::current().id();
        let mut slots = self.lock();
        loop {
            match slots.get(key) {
                Some(Slot::Ready(v)) => {
                    tracing::debug!(key = %key.digest(), "trace cache hit");
                    return Ok(v.clone());
                }
                Some(Slot::Tracing(owner)) if *owner == me => {
                    return Err(Error::invalid(format!(
                        "function re-entered itself while being traced for {}",
                        key
                    )));
                }
                Some(Slot::Tracing(_)) => {
                    slots = self.published.wait(slots).unwrap_or_else(|e| e.into_inner());
                }
                None => {
                    slots.insert(key.clone(), Slot::Tracing(me));
                    break;
                }
            }
        }
        drop(slots);

        tracing::debug!(key = %key.digest(), "trace cache miss");
        let claim = Claim {
            cache: self,
            key,
            done: false,
        };
        let value = Arc::new(trace()?);
        self.traces.fetch_add(1, Ordering::Relaxed);
        claim.publish(value.clone());
        Ok(value)
    }

    /// The published value for `key`, without tracing.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        match self.lock().get(key) {
            Some(Slot::Ready(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Published entries.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.lock()
            .values()
            .filter_map(|s| match s {
                Slot::Ready(v) => Some(v.clone()),
                Slot::Tracing(_) => None,
            })
            .collect()
    }

    /// Completed traces since creation.
    pub fn trace_count(&self) -> usize {
        self.traces.load(Ordering::Relaxed)
    }
}

/// An in-flight claim; dropped unpublished, it frees the key for the next caller.
struct Claim<'a, V> {
    cache: &'a TraceCache<V>,
    key: &'a CacheKey,
    done: bool,
}

impl<V> Claim<'_, V> {
    fn publish(mut self, value: Arc<V>) {
        self.cache.lock().insert(self.key.clone(), Slot::Ready(value));
        self.done = true;
        self.cache.published.notify_all();
    }
}

impl<V> Drop for Claim<'_, V> {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(key = %self.key.digest(), "trace abandoned");
            self.cache.lock().remove(self.key);
            self.cache.published.notify_all();
        }
    }
}
