//! Spinning reader-writer lock.
//!
//! The lock is a single 32-bit counter: `-1` is write-locked, `0` free and
//! `n > 0` held by `n` readers. Writers CAS `0 -> -1`, readers CAS
//! `n -> n + 1`.
//!
//! # Invariants
//!
//! - There is no writer preference and no starvation prevention. Writers are
//!   rare and brief (module load, type registration, thread attach); readers
//!   such as the GC stack walker must always make progress.
//! - Releases are release-ordered and acquires are acquire-ordered, so data
//!   written under the lock is visible to the next holder.
//! - Releasing in the wrong state is a fatal [`FatalKind::LockMisuse`].

use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam::utils::CachePadded;

use crate::config::{DEFAULT_SPIN_BACKOFF_FACTOR, DEFAULT_SPIN_INITIAL_DELAY, DEFAULT_SPIN_MAX_DELAY};
use crate::fatal::{fatal, FatalKind};

const WRITE_LOCKED: i32 = -1;

/// Reader-writer lock with exponential spin backoff.
#[derive(Debug)]
pub struct RwLock {
    count: CachePadded<AtomicI32>,
    initial_delay: u32,
    backoff_factor: u32,
    max_delay: u32,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_backoff(
            DEFAULT_SPIN_INITIAL_DELAY,
            DEFAULT_SPIN_BACKOFF_FACTOR,
            DEFAULT_SPIN_MAX_DELAY,
        )
    }

    #[must_use]
    pub const fn with_backoff(initial_delay: u32, backoff_factor: u32, max_delay: u32) -> Self {
        Self {
            count: CachePadded::new(AtomicI32::new(0)),
            initial_delay,
            backoff_factor,
            max_delay,
        }
    }

    pub fn try_acquire_read(&self) -> bool {
        let current = self.count.load(Ordering::Relaxed);
        if current == WRITE_LOCKED {
            return false;
        }
        self.count
            .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn acquire_read(&self) {
        self.spin_until(Self::try_acquire_read);
    }

    pub fn release_read(&self) {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        if prev <= 0 {
            self.count.fetch_add(1, Ordering::Relaxed);
            fatal(FatalKind::LockMisuse, "release-read of a lock without readers");
        }
    }

    pub fn try_acquire_write(&self) -> bool {
        self.count
            .compare_exchange(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn acquire_write(&self) {
        self.spin_until(Self::try_acquire_write);
    }

    pub fn release_write(&self) {
        if self
            .count
            .compare_exchange(WRITE_LOCKED, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            fatal(FatalKind::LockMisuse, "release-write of a lock not held for writing");
        }
    }

    /// Takes and immediately drops a read lock. Returns whether it could be
    /// taken without blocking, i.e. whether no writer held the lock at that instant.
    pub fn dangerous_try_pulse_read_lock(&self) -> bool {
        if self.try_acquire_read() {
            self.release_read();
            true
        } else {
            false
        }
    }

    /// True if some thread holds the lock for writing.
    pub fn is_write_locked(&self) -> bool {
        self.count.load(Ordering::Relaxed) == WRITE_LOCKED
    }

    /// Current reader count (0 when free or write-locked).
    pub fn reader_count(&self) -> u32 {
        u32::try_from(self.count.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn read(&self) -> ReadGuard<'_> {
        self.acquire_read();
        ReadGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        self.acquire_write();
        WriteGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        self.try_acquire_read().then(|| ReadGuard { lock: self })
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        self.try_acquire_write().then(|| WriteGuard { lock: self })
    }

    fn spin_until(&self, try_acquire: fn(&Self) -> bool) {
        let multi_cpu = sys_pal::processor_count() > 1;
        loop {
            if try_acquire(self) {
                return;
            }

            if multi_cpu {
                let mut delay = self.initial_delay.max(1);
                while delay < self.max_delay {
                    for _ in 0..delay {
                        std::hint::spin_loop();
                    }
                    if try_acquire(self) {
                        return;
                    }
                    delay = delay.saturating_mul(self.backoff_factor.max(2));
                }
            }

            sys_pal::switch_to_thread();
        }
    }
}

/// Read side held until drop.
#[must_use = "the read lock is released when the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Write side held until drop.
#[must_use = "the write lock is released when the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::catch_fatal;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_readers_share() {
        let lock = RwLock::new();
        assert!(lock.try_acquire_read());
        assert!(lock.try_acquire_read());
        assert_eq!(lock.reader_count(), 2);
        assert!(!lock.try_acquire_write());
        lock.release_read();
        lock.release_read();
        assert!(lock.try_acquire_write());
        lock.release_write();
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = RwLock::new();
        let guard = lock.write();
        assert!(lock.is_write_locked());
        assert!(!lock.try_acquire_read());
        assert!(!lock.dangerous_try_pulse_read_lock());
        drop(guard);
        assert!(lock.dangerous_try_pulse_read_lock());
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_try_guards_fail_cleanly_against_the_other_side() {
        let lock = RwLock::new();
        let writer = lock.write();
        let attempt = catch_fatal(|| lock.try_read().is_none());
        assert_eq!(attempt.ok(), Some(true));
        assert!(lock.is_write_locked());
        drop(writer);

        let reader = lock.read();
        let attempt = catch_fatal(|| lock.try_write().is_none());
        assert_eq!(attempt.ok(), Some(true));
        assert_eq!(lock.reader_count(), 1);
        drop(reader);

        let writer = lock.try_write().expect("free lock");
        drop(writer);
        assert!(lock.try_read().is_some());
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_release_read_when_free_is_fatal() {
        let lock = RwLock::new();
        let record = catch_fatal(|| lock.release_read()).expect_err("misuse");
        assert_eq!(record.kind, FatalKind::LockMisuse);
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.try_acquire_write());
        lock.release_write();
    }

    #[test]
    fn test_release_write_when_read_locked_is_fatal() {
        let lock = RwLock::new();
        let _guard = lock.read();
        let record = catch_fatal(|| lock.release_write()).expect_err("misuse");
        assert_eq!(record.kind, FatalKind::LockMisuse);
    }

    #[test]
    fn test_writers_serialize_increments() {
        let lock = Arc::new(RwLock::with_backoff(1, 2, 64));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let _w = lock.write();
                        let v = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let lock = Arc::new(RwLock::new());
        let guard = lock.write();
        let reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _r = lock.read();
                true
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!reader.is_finished());
        drop(guard);
        assert!(reader.join().unwrap());
    }
}
