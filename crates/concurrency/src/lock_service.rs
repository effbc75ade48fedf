//! `LockService`: a reference-counted map from [`Token`] to reader-writer
//! lock, offering RAII read / write guards.

use crate::token::Token;
use dashmap::DashMap;
use lock_api::{RawRwLock as _, RawRwLockTimed as _};
use parking_lot::RawRwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Entry {
    raw: RawRwLock,
    refs: AtomicUsize,
}

impl Entry {
    fn new() -> Self {
        Entry {
            raw: RawRwLock::INIT,
            refs: AtomicUsize::new(0),
        }
    }
}

/// A lazily-created, reference-counted map of Token -> reader-writer lock.
///
/// Entries are created on first access and removed once their refcount
/// drops to zero, so the map never grows past the number of resources
/// currently contended for. The service is a cheap handle over shared
/// state: clones lock against the same map, and guards carry their own
/// clone so they outlive any particular borrow of the service.
#[derive(Clone, Default)]
pub struct LockService {
    entries: Arc<DashMap<Token, Arc<Entry>>>,
}

impl LockService {
    /// Creates an empty lock service.
    pub fn new() -> Self {
        LockService {
            entries: Arc::new(DashMap::new()),
        }
    }

    fn acquire(&self, token: Token) -> Arc<Entry> {
        let entry = self
            .entries
            .entry(token)
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone();
        entry.refs.fetch_add(1, Ordering::SeqCst);
        entry
    }

    fn release(&self, token: Token, entry: &Arc<Entry>) {
        if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            // We may race with a fresh acquirer; only remove the map slot if
            // it is still ours and still unreferenced.
            self.entries.remove_if(&token, |_, e| {
                Arc::ptr_eq(e, entry) && e.refs.load(Ordering::SeqCst) == 0
            });
        }
    }

    /// Blocks until a shared (read) lock on `token` is held, and returns a
    /// guard that releases it on drop.
    pub fn read_lock(&self, token: Token) -> ReadGuard {
        let entry = self.acquire(token);
        entry.raw.lock_shared();
        ReadGuard {
            service: self.clone(),
            token,
            entry,
        }
    }

    /// Blocks until an exclusive (write) lock on `token` is held.
    pub fn write_lock(&self, token: Token) -> WriteGuard {
        let entry = self.acquire(token);
        entry.raw.lock_exclusive();
        WriteGuard {
            service: self.clone(),
            token,
            entry,
        }
    }

    /// Blocks for at most `timeout` waiting for an exclusive lock on
    /// `token`. `None` on expiry -- the caller is presumed deadlocked
    /// against another lock holder and should release everything and retry.
    pub fn write_lock_timeout(&self, token: Token, timeout: Duration) -> Option<WriteGuard> {
        let entry = self.acquire(token);
        if entry.raw.try_lock_exclusive_for(timeout) {
            Some(WriteGuard {
                service: self.clone(),
                token,
                entry,
            })
        } else {
            self.release(token, &entry);
            None
        }
    }

    /// Attempts to acquire a shared lock without blocking.
    pub fn try_read_lock(&self, token: Token) -> Option<ReadGuard> {
        let entry = self.acquire(token);
        if entry.raw.try_lock_shared() {
            Some(ReadGuard {
                service: self.clone(),
                token,
                entry,
            })
        } else {
            self.release(token, &entry);
            None
        }
    }

    /// Attempts to acquire an exclusive lock without blocking.
    pub fn try_write_lock(&self, token: Token) -> Option<WriteGuard> {
        let entry = self.acquire(token);
        if entry.raw.try_lock_exclusive() {
            Some(WriteGuard {
                service: self.clone(),
                token,
                entry,
            })
        } else {
            self.release(token, &entry);
            None
        }
    }

    /// The number of distinct tokens currently tracked (held or waited on).
    pub fn live_token_count(&self) -> usize {
        self.entries.len()
    }
}

/// A held shared lock on a [`Token`]. Dropping it releases the lock.
pub struct ReadGuard {
    service: LockService,
    token: Token,
    entry: Arc<Entry>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        unsafe { self.entry.raw.unlock_shared() };
        self.service.release(self.token, &self.entry);
    }
}

/// A held exclusive lock on a [`Token`]. Dropping it releases the lock.
pub struct WriteGuard {
    service: LockService,
    token: Token,
    entry: Arc<Entry>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        unsafe { self.entry.raw.unlock_exclusive() };
        self.service.release(self.token, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_do_not_block_each_other() {
        let svc = LockService::new();
        let t = Token::point("k", b"v", 1);
        let _g1 = svc.read_lock(t);
        let g2 = svc.try_read_lock(t);
        assert!(g2.is_some());
    }

    #[test]
    fn writer_excludes_readers() {
        let svc = LockService::new();
        let t = Token::point("k", b"v", 1);
        let _g1 = svc.write_lock(t);
        assert!(svc.try_read_lock(t).is_none());
    }

    #[test]
    fn entry_is_garbage_collected_after_release() {
        let svc = LockService::new();
        let t = Token::point("k", b"v", 1);
        {
            let _g = svc.write_lock(t);
            assert_eq!(svc.live_token_count(), 1);
        }
        assert_eq!(svc.live_token_count(), 0);
    }

    #[test]
    fn write_lock_is_exclusive_across_threads() {
        let svc = LockService::new();
        let t = Token::point("k", b"v", 1);
        let flag = Arc::new(AtomicBool::new(false));

        let guard = svc.write_lock(t);
        let svc2 = svc.clone();
        let flag2 = flag.clone();
        let handle = thread::spawn(move || {
            let _g = svc2.write_lock(t);
            flag2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!flag.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_outlives_the_borrow_it_was_taken_from() {
        let svc = LockService::new();
        let guard = {
            let clone = svc.clone();
            clone.write_lock(Token::point("k", b"v", 2))
        };
        assert_eq!(svc.live_token_count(), 1);
        drop(guard);
        assert_eq!(svc.live_token_count(), 0);
    }
}
