//! A fork/join task scheduler with work stealing, for fine-grained nested
//! parallelism inside a single process.
//!
//! What this provides:
//! - A per-thread task deque with a lock-free steal protocol: the owner
//!   works the right end in LIFO order, thieves take the oldest tasks from
//!   the left.
//! - Scheduling contexts ([`TaskScheduler`]) that keep independent
//!   submitters isolated from each other while multiplexing one
//!   process-wide pool of worker threads ([`ThreadPool`]).
//! - Structured fork/join: a task spawns children and waits for them before
//!   returning. The scheduler enforces the discipline, tracks parent/child
//!   dependencies, and propagates the first failure raised anywhere in a
//!   parallel region back to the submitter.
//!
//! Tasks run to completion once started. While work exists anywhere in a
//! scheduler, its workers spin, steal and yield rather than block, so this
//! is a poor fit for I/O-bound jobs.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! spindle::create(0, false);
//!
//! let sum = AtomicUsize::new(0);
//! let sum = &sum;
//! spindle::spawn_root_and_wait(|| {
//!     for i in 1..=100usize {
//!         unsafe {
//!             spindle::spawn(move || {
//!                 sum.fetch_add(i, Ordering::Relaxed);
//!             });
//!         }
//!     }
//!     assert!(spindle::wait());
//! });
//! assert_eq!(sum.load(Ordering::Relaxed), 5050);
//!
//! spindle::destroy();
//! ```

mod core;
pub mod util;

pub use crate::core::scheduler::TaskScheduler;
pub use crate::core::thread_pool::{ThreadPool, ThreadPoolBuilder};
pub use crate::core::{
    add_scheduler, create, destroy, remove_scheduler, spawn, spawn_root_and_wait, spawn_sized,
    start_threads, thread_count, thread_index, wait,
};
