//! `RangeLockService`: per-key range-vs-point locking for phantom
//! prevention.

use crate::extent::Extent;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

struct Held {
    id: u64,
    owner: u64,
    extent: Extent,
    mode: Mode,
}

#[derive(Default)]
struct KeyState {
    held: Vec<Held>,
    pending_writers: usize,
    next_id: u64,
}

struct KeyLock {
    state: Mutex<KeyState>,
    changed: Condvar,
}

impl KeyLock {
    fn new() -> Self {
        KeyLock {
            state: Mutex::new(KeyState::default()),
            changed: Condvar::new(),
        }
    }
}

/// Grants range-aware read and write locks per key.
///
/// A read lock covering `[lo, hi)` blocks (and is blocked by) any write
/// lock whose point value falls in `[lo, hi)`; two read locks never
/// conflict, no matter how their intervals overlap. Locks belonging to the
/// same **owner** never conflict with each other, so an atomic operation
/// can verify a value (read point) and then write it (write point) without
/// deadlocking on itself. Like [`crate::LockService`], this is a cheap
/// handle over shared state -- clones observe the same held locks.
#[derive(Clone)]
pub struct RangeLockService {
    keys: Arc<Mutex<HashMap<String, Arc<KeyLock>>>>,
    owners: Arc<AtomicU64>,
}

impl Default for RangeLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeLockService {
    /// Creates an empty service.
    pub fn new() -> Self {
        RangeLockService {
            keys: Arc::new(Mutex::new(HashMap::new())),
            owners: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mints an owner identity. Locks taken under the same owner never
    /// conflict with each other; every independent unit of work (an atomic
    /// operation, or a single engine-level read) should hold its own.
    pub fn mint_owner(&self) -> u64 {
        self.owners.fetch_add(1, Ordering::Relaxed)
    }

    fn key_lock(&self, key: &str) -> Arc<KeyLock> {
        self.keys
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone()
    }

    /// Acquires a read range-lock over `extent` for `key`, blocking while
    /// any overlapping foreign write lock is held, and yielding to writers
    /// that are already waiting so they are never starved -- unless this
    /// owner already holds a lock on the key, in which case barring it
    /// would deadlock against the very writer it is yielding to.
    pub fn read_lock(&self, key: &str, extent: Extent, owner: u64) -> RangeGuard {
        self.read_lock_inner(key, extent, owner, None)
            .expect("untimed read_lock cannot time out")
    }

    /// Like [`RangeLockService::read_lock`] but gives up after `timeout`;
    /// see [`RangeLockService::write_lock_timeout`] for why a bounded wait
    /// exists.
    pub fn read_lock_timeout(
        &self,
        key: &str,
        extent: Extent,
        owner: u64,
        timeout: Duration,
    ) -> Option<RangeGuard> {
        self.read_lock_inner(key, extent, owner, Some(timeout))
    }

    fn read_lock_inner(
        &self,
        key: &str,
        extent: Extent,
        owner: u64,
        timeout: Option<Duration>,
    ) -> Option<RangeGuard> {
        let lock = self.key_lock(key);
        let deadline = timeout.map(|t| Instant::now() + t);
        let id;
        {
            let mut state = lock.state.lock();
            loop {
                let conflicts = state.held.iter().any(|h| {
                    h.owner != owner && h.mode == Mode::Write && h.extent.overlaps(&extent)
                });
                let owns_here = state.held.iter().any(|h| h.owner == owner);
                if !conflicts && (owns_here || state.pending_writers == 0) {
                    id = state.next_id;
                    state.next_id += 1;
                    state.held.push(Held {
                        id,
                        owner,
                        extent: extent.clone(),
                        mode: Mode::Read,
                    });
                    break;
                }
                match deadline {
                    None => {
                        lock.changed.wait(&mut state);
                    }
                    Some(deadline) => {
                        if lock.changed.wait_until(&mut state, deadline).timed_out() {
                            return None;
                        }
                    }
                }
            }
        }
        Some(RangeGuard {
            key: key.to_string(),
            lock,
            id,
        })
    }

    /// Acquires an exclusive write range-lock covering `extent` (normally
    /// [`Extent::point`]) for `key`, blocking indefinitely.
    pub fn write_lock(&self, key: &str, extent: Extent, owner: u64) -> RangeGuard {
        self.write_lock_inner(key, extent, owner, None)
            .expect("untimed write_lock cannot time out")
    }

    /// Like [`RangeLockService::write_lock`] but gives up after `timeout`.
    ///
    /// Two operations that each hold a read lock and then request an
    /// overlapping write lock are deadlocked; neither can be granted while
    /// the other's read is held. The timeout is how that knot is cut: the
    /// waiter that expires releases everything and retries, and the
    /// survivor proceeds.
    pub fn write_lock_timeout(
        &self,
        key: &str,
        extent: Extent,
        owner: u64,
        timeout: Duration,
    ) -> Option<RangeGuard> {
        self.write_lock_inner(key, extent, owner, Some(timeout))
    }

    fn write_lock_inner(
        &self,
        key: &str,
        extent: Extent,
        owner: u64,
        timeout: Option<Duration>,
    ) -> Option<RangeGuard> {
        let lock = self.key_lock(key);
        let deadline = timeout.map(|t| Instant::now() + t);
        let id;
        {
            let mut state = lock.state.lock();
            state.pending_writers += 1;
            loop {
                let conflicts = state
                    .held
                    .iter()
                    .any(|h| h.owner != owner && h.extent.overlaps(&extent));
                if !conflicts {
                    id = state.next_id;
                    state.next_id += 1;
                    state.held.push(Held {
                        id,
                        owner,
                        extent: extent.clone(),
                        mode: Mode::Write,
                    });
                    state.pending_writers -= 1;
                    break;
                }
                match deadline {
                    None => {
                        lock.changed.wait(&mut state);
                    }
                    Some(deadline) => {
                        if lock.changed.wait_until(&mut state, deadline).timed_out() {
                            state.pending_writers -= 1;
                            drop(state);
                            // Readers barred by our pending-writer mark must
                            // be rechecked now that it is gone.
                            lock.changed.notify_all();
                            return None;
                        }
                    }
                }
            }
        }
        Some(RangeGuard {
            key: key.to_string(),
            lock,
            id,
        })
    }
}

/// A held range lock. Dropping it releases the lock and wakes any waiters.
pub struct RangeGuard {
    key: String,
    lock: Arc<KeyLock>,
    id: u64,
}

impl RangeGuard {
    /// The key this guard locks.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.held.retain(|h| h.id != self.id);
        drop(state);
        self.lock.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::Value;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn two_reads_over_same_range_coexist() {
        let svc = RangeLockService::new();
        let _a = svc.read_lock("k", Extent::full(), svc.mint_owner());
        let _b = svc.read_lock("k", Extent::point(Value::Int32(1)), svc.mint_owner());
    }

    #[test]
    fn write_blocks_overlapping_read() {
        let svc = RangeLockService::new();
        let _w = svc.write_lock("k", Extent::point(Value::Int32(5)), svc.mint_owner());
        let got = Arc::new(AtomicBool::new(false));
        let svc2 = svc.clone();
        let got2 = got.clone();
        let handle = thread::spawn(move || {
            let owner = svc2.mint_owner();
            let _r = svc2.read_lock("k", Extent::range(Value::Int32(0), Value::Int32(10)), owner);
            got2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!got.load(Ordering::SeqCst));
        drop(_w);
        handle.join().unwrap();
        assert!(got.load(Ordering::SeqCst));
    }

    #[test]
    fn write_outside_read_range_does_not_conflict() {
        let svc = RangeLockService::new();
        let _r = svc.read_lock("k", Extent::range(Value::Int32(0), Value::Int32(10)), svc.mint_owner());
        // value 10 is outside [0, 10)
        let _w = svc.write_lock("k", Extent::point(Value::Int32(10)), svc.mint_owner());
    }

    #[test]
    fn same_owner_can_upgrade_its_own_point_read() {
        let svc = RangeLockService::new();
        let owner = svc.mint_owner();
        let _r = svc.read_lock("k", Extent::point(Value::Int32(5)), owner);
        // a foreign owner would block here; the same owner must not
        let _w = svc
            .write_lock_timeout("k", Extent::point(Value::Int32(5)), owner, Duration::from_millis(50))
            .expect("own read lock must not block own write lock");
    }

    #[test]
    fn timed_out_writer_reports_failure_and_leaves_no_residue() {
        let svc = RangeLockService::new();
        let _r = svc.read_lock("k", Extent::point(Value::Int32(5)), svc.mint_owner());
        let w = svc.write_lock_timeout("k", Extent::point(Value::Int32(5)), svc.mint_owner(), Duration::from_millis(20));
        assert!(w.is_none());
        drop(_r);
        // the failed wait must not have left a pending-writer mark behind
        let _r2 = svc.read_lock("k", Extent::point(Value::Int32(5)), svc.mint_owner());
    }
}
