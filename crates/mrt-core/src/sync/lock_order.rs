//! # Lock Ordering Discipline
//!
//! The core holds very few locks, but some of them are held across calls
//! into other subsystems. They must be acquired in increasing level:
//!
//! | Level | Lock             | Description                                  |
//! |-------|------------------|----------------------------------------------|
//! | 1     | `ThreadStore`    | Thread list; held for a whole suspension     |
//! | 2     | `ModuleRegistry` | Module list and static descriptors           |
//! | 3     | `WriteBarrier`   | Serializes write-barrier global updates      |
//!
//! The hijack path only pulses the registry lock (see
//! `RwLock::dangerous_try_pulse_read_lock`) and never registers with this
//! tracker, because it may run in signal context.
//!
//! Validation happens in debug builds only.

use std::cell::RefCell;

const MAX_LOCK_DEPTH: usize = 8;

thread_local!(static HELD_LEVELS: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    ThreadStore = 1,
    ModuleRegistry = 2,
    WriteBarrier = 3,
}

impl LockOrder {
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// RAII marker recording that the current thread holds a lock of `tag`'s level.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates `tag` against the highest level already held.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when a lower level is acquired while holding a
    /// higher one.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let _ = HELD_LEVELS.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(&max) = held.iter().max() {
                    debug_assert!(
                        tag.level() >= max,
                        "Lock ordering violation: {tag:?} (level {}) acquired while holding level {max}",
                        tag.level()
                    );
                }
                held.push(tag.level());
            });
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = HELD_LEVELS.try_with(|held| {
            held.borrow_mut().pop();
        });
    }
}

/// Highest level currently held by this thread, or 0.
#[must_use]
pub fn max_held_level() -> u8 {
    HELD_LEVELS
        .try_with(|held| held.borrow().iter().copied().max().unwrap_or(0))
        .unwrap_or(0)
}
