//! Synchronization primitives of the core.

mod event;
pub mod lock_order;
mod rwlock;

pub use event::{Event, WaitResult};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
