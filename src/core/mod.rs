//! The scheduler core.
//!
//! This module wires the pieces together and exposes the crate-level
//! submission surface: a process-wide thread pool that schedulers attach to,
//! and free functions that locate the calling thread's worker context
//! through a thread-local, so tasks can spawn and wait without carrying a
//! handle around.

pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod thread_pool;

use crate::core::scheduler::{current_thread, TaskScheduler};
use crate::core::sync::Arc;
use crate::core::thread_pool::ThreadPool;

// Use a std mutex explicitly here because loom's doesn't support static
// initialization.
static THREAD_POOL: std::sync::Mutex<Option<Arc<ThreadPool>>> = std::sync::Mutex::new(None);

/// Initialize the process-wide thread pool.
///
/// `num_threads == 0` means one thread per logical CPU. Thread index 0 is
/// reserved for the submitting thread, so a pool of size N spawns N-1
/// workers. Calling this again reconfigures the worker count of the
/// existing pool; affinity is fixed by the first call.
pub fn create(num_threads: usize, set_affinity: bool) {
    let pool = {
        let mut slot = THREAD_POOL.lock().unwrap();
        slot.get_or_insert_with(|| ThreadPool::builder().with_affinity(set_affinity).build())
            .clone()
    };
    pool.set_num_threads(num_threads, false);
}

/// Tear down the process-wide thread pool, joining all of its OS threads.
pub fn destroy() {
    let pool = THREAD_POOL.lock().unwrap().take();
    if let Some(pool) = pool {
        pool.shut_down();
    }
}

pub(crate) fn thread_pool() -> Option<Arc<ThreadPool>> {
    THREAD_POOL.lock().unwrap().clone()
}

/// Make sure the pool's worker threads are running. Idempotent.
///
/// A no-op if the pool has not been created; schedulers then drain on the
/// submitting thread alone.
pub fn start_threads() {
    if let Some(pool) = thread_pool() {
        pool.start_threads();
    }
}

/// Attach a scheduling context to the process-wide pool.
pub fn add_scheduler(scheduler: &Arc<TaskScheduler>) {
    if let Some(pool) = thread_pool() {
        pool.add(scheduler);
    }
}

/// Detach a scheduling context from the process-wide pool.
pub fn remove_scheduler(scheduler: &Arc<TaskScheduler>) {
    if let Some(pool) = thread_pool() {
        pool.remove(scheduler);
    }
}

/// The caller's thread index within its scheduler, 0 when not enrolled.
pub fn thread_index() -> usize {
    let thread = current_thread();
    if thread.is_null() {
        0
    } else {
        unsafe { (*thread).thread_index }
    }
}

/// The size of the process-wide thread pool, 0 before `create`.
pub fn thread_count() -> usize {
    thread_pool().map(|pool| pool.num_threads()).unwrap_or(0)
}

/// Spawn a child task under the currently running task.
///
/// Returns once the task is enqueued. When called outside any task, the
/// closure runs as a root task instead, on the calling thread's sticky
/// scheduler, and this call blocks until it completes.
///
/// Safety: the closure and everything it borrows must stay valid until the
/// task has executed. The caller guarantees this by calling [`wait`] before
/// the spawning task returns; returning without waiting is a fatal error.
pub unsafe fn spawn<F: FnOnce() + Send>(closure: F) {
    spawn_sized(1, closure);
}

/// Like [`spawn`], with an estimate of the task's work size that thieves use
/// to decide whether stealing is worthwhile.
///
/// Safety: same contract as [`spawn`].
pub unsafe fn spawn_sized<F: FnOnce() + Send>(size_hint: usize, closure: F) {
    let thread = current_thread();
    if !thread.is_null() {
        (*thread)
            .tasks
            .push_right((*thread).task.get(), size_hint, closure);
    } else {
        TaskScheduler::instance().spawn_root(size_hint, closure);
    }
}

/// Called by a task after spawning children: drains local work until all
/// direct children have completed.
///
/// Returns false when the scheduler is cancelling; the caller should then
/// stop spawning further work. Outside any task this is a no-op returning
/// true.
pub fn wait() -> bool {
    profiling::scope!("wait");
    crate::core::scheduler::wait_for_children()
}

/// Run `closure` as the root of a parallel task tree and wait for the whole
/// tree to complete.
///
/// Uses the calling thread's sticky scheduler and the process-wide pool.
/// Panics raised by any task in the tree are resumed on the caller.
pub fn spawn_root_and_wait<F: FnOnce() + Send>(closure: F) {
    let scheduler = TaskScheduler::instance();
    // The scheduler must be reset even when the submission rethrows a task
    // failure, or the sticky instance would keep its root task gate up and
    // confuse the next submission's joiners.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        scheduler.spawn_root(1, closure)
    }));
    scheduler.reset();
    if let Err(payload) = result {
        std::panic::resume_unwind(payload);
    }
}

/// Tests share the process-wide pool; they take this lock to stay out of
/// each other's way.
#[cfg(test)]
pub(crate) fn pool_test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn introspection_outside_tasks() {
    assert_eq!(thread_index(), 0);

    let _serial = pool_test_lock();
    create(2, false);
    assert_eq!(thread_count(), 2);
    destroy();
    assert_eq!(thread_count(), 0);
}
