//! Pairs synchronous commands with replies delivered by a reader thread.
//!
//! Callers register a key before sending, then block on the returned
//! [`PendingReply`]. The reader thread is the only resolver. Each slot is
//! written at most once and is removed from the table when the reply is
//! consumed, when the wait times out, or when the connection fails.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ProtoError, Result};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot<V> {
    value: Mutex<Option<Result<V>>>,
    ready: Condvar,
}

impl<V> Slot<V> {
    fn fill(&self, value: Result<V>) {
        let mut guard = lock(&self.value);
        if guard.is_none() {
            *guard = Some(value);
        }
        self.ready.notify_all();
    }
}

struct Table<K, V> {
    pending: HashMap<K, Arc<Slot<V>>>,
    closed: bool,
}

/// Table of outstanding requests keyed by token.
///
/// Cloning shares the table: one clone lives with the senders, another with
/// the reader thread.
pub struct Correlator<K, V> {
    table: Arc<Mutex<Table<K, V>>>,
}

impl<K, V> Clone for Correlator<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug, V> Default for Correlator<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Debug, V> Correlator<K, V> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                pending: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Register interest in the reply for `key`.
    ///
    /// Fails with [`ProtoError::ConnectionLost`] once [`fail_all`](Self::fail_all)
    /// has run. Registering a key that is already pending replaces the older
    /// waiter, which then fails with `ConnectionLost`.
    pub fn register(&self, key: K) -> Result<PendingReply<K, V>> {
        let slot = Arc::new(Slot {
            value: Mutex::new(None),
            ready: Condvar::new(),
        });

        let mut table = lock(&self.table);
        if table.closed {
            return Err(ProtoError::ConnectionLost);
        }
        if let Some(previous) = table.pending.insert(key.clone(), Arc::clone(&slot)) {
            warn!(?key, "replacing a pending request with the same key");
            previous.fill(Err(ProtoError::ConnectionLost));
        }
        drop(table);

        Ok(PendingReply {
            key,
            slot,
            table: Arc::clone(&self.table),
        })
    }

    /// Deliver a reply. Returns `false` when nobody is waiting for `key`.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        self.complete(key, Ok(value))
    }

    /// Deliver a failure to the waiter for `key`.
    pub fn reject(&self, key: &K, err: ProtoError) -> bool {
        self.complete(key, Err(err))
    }

    fn complete(&self, key: &K, value: Result<V>) -> bool {
        let slot = lock(&self.table).pending.remove(key);
        match slot {
            Some(slot) => {
                slot.fill(value);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `ConnectionLost` and refuse new ones.
    ///
    /// Returns how many waiters were released.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = lock(&self.table);
            table.closed = true;
            table.pending.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for slot in drained {
            slot.fill(Err(ProtoError::ConnectionLost));
        }
        if count > 0 {
            debug!(count, "released pending requests after connection failure");
        }
        count
    }

    /// Whether the table has been closed by [`fail_all`](Self::fail_all).
    pub fn is_closed(&self) -> bool {
        lock(&self.table).closed
    }

    /// Number of requests currently waiting.
    pub fn pending(&self) -> usize {
        lock(&self.table).pending.len()
    }
}

/// A registered request waiting for its reply.
///
/// Dropping it without waiting removes the registration.
pub struct PendingReply<K: Eq + Hash, V> {
    key: K,
    slot: Arc<Slot<V>>,
    table: Arc<Mutex<Table<K, V>>>,
}

impl<K: Eq + Hash, V> PendingReply<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Block until the reply arrives.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` only polls. On
    /// expiry the registration is removed and [`ProtoError::Timeout`] is
    /// returned.
    pub fn wait(self, timeout: Option<Duration>) -> Result<V> {
        let mut guard = lock(&self.slot.value);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(value) = guard.take() {
                return value;
            }
            match deadline {
                None => {
                    guard = self
                        .slot
                        .ready
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ProtoError::Timeout(timeout.unwrap_or_default()));
                    }
                    guard = self
                        .slot
                        .ready
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

impl<K: Eq + Hash, V> Drop for PendingReply<K, V> {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        let ours = table
            .pending
            .get(&self.key)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot));
        if ours {
            table.pending.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn resolve_wakes_waiter() {
        let correlator: Correlator<u64, &'static str> = Correlator::new();
        let pending = correlator.register(7).expect("should register");

        let resolver = correlator.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(resolver.resolve(&7, "done"));
        });

        let value = pending
            .wait(Some(Duration::from_secs(5)))
            .expect("should resolve");
        assert_eq!(value, "done");
        handle.join().unwrap();
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn reply_before_wait_is_kept() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        let pending = correlator.register(1).expect("should register");
        assert!(correlator.resolve(&1, 42));
        assert_eq!(pending.wait(Some(Duration::ZERO)).expect("ready"), 42);
    }

    #[test]
    fn timeout_removes_registration() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        let pending = correlator.register(3).expect("should register");

        let started = Instant::now();
        let err = pending.wait(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, ProtoError::Timeout(d) if d == Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.resolve(&3, 1), "late reply should find no waiter");
    }

    #[test]
    fn zero_timeout_polls() {
        let correlator: Correlator<(), u8> = Correlator::new();
        let pending = correlator.register(()).expect("should register");
        let err = pending.wait(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, ProtoError::Timeout(_)));
    }

    #[test]
    fn fail_all_releases_waiters_and_closes() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        let a = correlator.register(1).expect("should register");
        let b = correlator.register(2).expect("should register");

        let waiter = thread::spawn(move || a.wait(None));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(correlator.fail_all(), 2);

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ProtoError::ConnectionLost)));
        assert!(matches!(
            b.wait(Some(Duration::ZERO)),
            Err(ProtoError::ConnectionLost)
        ));
        assert!(correlator.is_closed());
        assert!(matches!(
            correlator.register(3),
            Err(ProtoError::ConnectionLost)
        ));
    }

    #[test]
    fn duplicate_key_fails_older_waiter() {
        let correlator: Correlator<(), u32> = Correlator::new();
        let first = correlator.register(()).expect("should register");
        let second = correlator.register(()).expect("should register");

        assert!(matches!(
            first.wait(Some(Duration::ZERO)),
            Err(ProtoError::ConnectionLost)
        ));
        // Dropping the old waiter must not remove the new registration.
        assert_eq!(correlator.pending(), 1);
        assert!(correlator.resolve(&(), 9));
        assert_eq!(second.wait(Some(Duration::ZERO)).expect("ready"), 9);
    }

    #[test]
    fn reject_delivers_error() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        let pending = correlator.register(5).expect("should register");
        assert!(correlator.reject(&5, ProtoError::Gdb("bad".into())));
        assert!(matches!(
            pending.wait(Some(Duration::ZERO)),
            Err(ProtoError::Gdb(msg)) if msg == "bad"
        ));
    }

    #[test]
    fn dropped_pending_unregisters() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        {
            let _pending = correlator.register(11).expect("should register");
            assert_eq!(correlator.pending(), 1);
        }
        assert_eq!(correlator.pending(), 0);
    }
}
