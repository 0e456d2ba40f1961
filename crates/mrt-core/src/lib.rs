//! The execution core of a managed runtime.
//!
//! `mrt-core` is the part of a runtime that sits between compiled managed
//! code and a garbage collector. It knows which threads are running managed
//! code, brings them to a safe point when the collector asks, and walks
//! their stacks to report every live reference.
//!
//! # Overview
//!
//! - **Modules**: compiled code registers a [`ModuleDescriptor`] with the
//!   [`ModuleRegistry`]; its methods carry compact GC info that the
//!   [`gcinfo`] decoder reads at walk time.
//! - **Threads**: each OS thread that runs managed code attaches to the
//!   [`ThreadStore`] and flips between *cooperative* mode (running managed
//!   code, may hold references) and *preemptive* mode (in native code, safe
//!   to collect under).
//! - **Suspension**: [`Runtime::suspend_ee`] raises the trap flag, waits for
//!   preemptive threads to be stable and redirects cooperative ones through
//!   return-address hijacking until every thread has reached a safe point.
//! - **Stack walks**: [`StackFrameIterator`] unwinds managed frames from a
//!   thread's transition frame, and [`gc_interface::scan_stack_roots`]
//!   turns each frame's live slots into root reports.
//!
//! # Quick Start
//!
//! ```
//! use mrt_core::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let thread = runtime.attach_current_thread();
//! assert!(thread.is_attached());
//!
//! let metrics = runtime.suspend_ee("example");
//! assert_eq!(metrics.hijacks_installed, 0);
//! assert!(runtime.write_barrier().is_gc_in_progress());
//! runtime.restart_ee();
//!
//! runtime.detach_current_thread();
//! ```
//!
//! # Collector Integration
//!
//! A collector plugs in through [`GcHeap`] and [`HandleTable`], and enumerates
//! roots with the functions in [`gc_interface`] between
//! [`Runtime::suspend_ee`] and [`Runtime::restart_ee`].

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod config;
pub mod fatal;
pub mod fault;
pub mod gc_interface;
pub mod gcinfo;
mod metrics;
pub mod module;
pub mod object;
pub mod regdisplay;
mod runtime;
pub mod stackwalk;
pub mod stubs;
pub mod sync;
pub mod thread;
mod tracing;
pub mod varint;
pub mod write_barrier;

// Re-export public API
pub use config::RuntimeConfig;
pub use fatal::{FatalKind, FatalRecord};
pub use gc_interface::{GcHeap, HandleKind, HandleTable, ObjectHandle, ScanContext};
pub use gcinfo::GcFlags;
pub use metrics::{GlobalMetrics, SuspendMetrics};
pub use module::{Module, ModuleDescriptor, ModuleRegistry, Region};
pub use runtime::{Runtime, RuntimeBuilder};
pub use stackwalk::StackFrameIterator;
pub use stubs::{Thunk, ThunkRegistry};
pub use thread::{Thread, ThreadStore, TransitionFrame};
pub use crate::tracing::SuspendId;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;
