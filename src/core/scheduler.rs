//! Scheduling contexts and the work-stealing loop.
//!
//! A `TaskScheduler` groups the threads draining one root task and isolates
//! them from other contexts sharing the same thread pool. Enrolled threads
//! publish themselves in the scheduler's thread table so peers can steal
//! from their queues; a thread-local pointer to the current `Thread` lets
//! submission APIs find their worker without threading a context through
//! every call.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic;
use std::ptr;

use aliasable::boxed::AliasableBox;
use crossbeam_utils::{Backoff, CachePadded};
use tracing::trace;

use crate::core::queue::TaskQueue;
use crate::core::sync::{
    thread, Arc, AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Condvar, Mutex, Ordering,
};
use crate::core::task::Task;
use crate::util::{fatal_error, pause_cpu};

/// Per-worker context for one scheduler enrollment.
pub(crate) struct Thread {
    /// Dense index within the scheduler, unique while the thread is enrolled.
    pub(crate) thread_index: usize,
    scheduler: Arc<TaskScheduler>,
    pub(crate) tasks: TaskQueue,
    /// The task currently executing on this thread, if any. Owner only; lets
    /// `execute_local` recognize the task a `wait` is synchronizing on.
    pub(crate) task: Cell<*mut Task>,
}

impl Thread {
    pub(crate) fn new(thread_index: usize, scheduler: Arc<TaskScheduler>) -> Self {
        Thread {
            thread_index,
            scheduler,
            tasks: TaskQueue::new(),
            task: Cell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }
}

thread_local! {
    /// The `Thread` this OS thread is currently enrolled as, if any.
    static CURRENT_THREAD: Cell<*const Thread> = const { Cell::new(ptr::null()) };

    /// Lazily created sticky scheduler, used for submissions from threads
    /// that are not already running inside a task.
    static INSTANCE: RefCell<Option<Arc<TaskScheduler>>> = const { RefCell::new(None) };
}

/// The current thread's worker context, null when not enrolled.
pub(crate) fn current_thread() -> *const Thread {
    CURRENT_THREAD.with(|cell| cell.get())
}

/// Install a new current thread, returning the previous one.
pub(crate) fn swap_thread(thread: *const Thread) -> *const Thread {
    CURRENT_THREAD.with(|cell| cell.replace(thread))
}

/// First-writer-wins slot for the panic payload that poisons a scheduler.
///
/// The flag is what the hot path reads; the payload itself sits behind a
/// mutex and is only touched when a task fails or a submitter rethrows.
struct PanicSlot {
    poisoned: AtomicBool,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PanicSlot {
    fn new() -> Self {
        PanicSlot {
            poisoned: AtomicBool::new(false),
            payload: Mutex::new(None),
        }
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn fill(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.payload.lock().unwrap();
        // Later failures are dropped: the first one is the one the
        // submitter observes.
        if slot.is_none() {
            *slot = Some(payload);
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }

    fn take(&self) -> Option<Box<dyn Any + Send>> {
        let mut slot = self.payload.lock().unwrap();
        let payload = slot.take();
        if payload.is_some() {
            self.poisoned.store(false, Ordering::SeqCst);
        }
        payload
    }

    fn clear(&self) {
        let mut slot = self.payload.lock().unwrap();
        *slot = None;
        self.poisoned.store(false, Ordering::SeqCst);
    }
}

/// A scheduling context.
///
/// Holds the threads enrolled in draining one root task, the termination
/// counter they coordinate through, and the first failure any of them
/// captured. Schedulers are shared between the submitter and the thread
/// pool through `Arc`, so dropping the submitter's handle while workers are
/// still draining is fine.
pub struct TaskScheduler {
    /// Number of threads currently enrolled.
    thread_counter: AtomicUsize,
    /// Tracks whether any worker is still executing tasks. Incremented
    /// inside the steal loop body before draining, so a worker that has just
    /// stolen work is counted before its peers can observe "no work" and
    /// exit.
    any_tasks_running: AtomicI32,
    /// Gates joining submitters until a root task exists.
    has_root_task: AtomicBool,
    /// Enrolled threads by dense index. Each slot is written only by the
    /// thread owning that index and read by peers as atomic pointer loads.
    thread_local: Box<[CachePadded<AtomicPtr<Thread>>]>,
    mutex: Mutex<()>,
    condition: Condvar,
    cancelling_panic: PanicSlot,
}

impl TaskScheduler {
    pub fn new() -> Self {
        // Twice the logical thread count so that joining submitters can
        // enroll next to the pool's workers, with a floor for small machines
        // driving pools wider than their CPU count.
        let table_size = 2 * num_cpus::get().max(32);
        TaskScheduler {
            thread_counter: AtomicUsize::new(0),
            any_tasks_running: AtomicI32::new(0),
            has_root_task: AtomicBool::new(false),
            thread_local: (0..table_size)
                .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
                .collect(),
            mutex: Mutex::new(()),
            condition: Condvar::new(),
            cancelling_panic: PanicSlot::new(),
        }
    }

    /// The calling thread's sticky fallback scheduler, created on first use.
    pub fn instance() -> Arc<TaskScheduler> {
        INSTANCE.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| Arc::new(TaskScheduler::new()))
                .clone()
        })
    }

    /// Allocate a dense thread index for an enrolling thread.
    pub(crate) fn alloc_thread_index(&self) -> usize {
        let thread_index = self.thread_counter.fetch_add(1, Ordering::SeqCst);
        if thread_index >= self.thread_local.len() {
            // TODO: grow the table instead of aborting when an unusually
            // deep nesting of joining submitters runs it out of slots.
            fatal_error("too many threads enrolled in one scheduler");
        }
        thread_index
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelling_panic.is_poisoned()
    }

    pub(crate) fn set_cancelling_panic(&self, payload: Box<dyn Any + Send>) {
        self.cancelling_panic.fill(payload);
    }

    /// Clear the root task gate and any captured failure, making the
    /// scheduler ready for the next submission.
    pub fn reset(&self) {
        self.has_root_task.store(false, Ordering::Release);
        self.cancelling_panic.clear();
    }

    /// Submit a root task and run it to completion.
    ///
    /// The calling thread enrolls as a worker of this scheduler and executes
    /// tasks until the whole tree below the root has completed. If any task
    /// panicked, the first captured payload is resumed on the caller.
    pub fn spawn_root<F: FnOnce() + Send>(self: &Arc<Self>, size_hint: usize, closure: F) {
        profiling::scope!("spawn_root");

        crate::core::start_threads();

        let thread_index = self.alloc_thread_index();
        let thread = AliasableBox::from_unique(Box::new(Thread::new(thread_index, self.clone())));
        self.thread_local[thread_index]
            .store(&*thread as *const Thread as *mut Thread, Ordering::Release);
        let previous = swap_thread(&*thread);

        unsafe {
            thread.tasks.push_right(ptr::null_mut(), size_hint, closure);
        }

        {
            let _guard = self.mutex.lock().unwrap();
            self.any_tasks_running.fetch_add(1, Ordering::SeqCst);
            self.has_root_task.store(true, Ordering::Release);
        }
        self.condition.notify_all();

        crate::core::add_scheduler(self);

        unsafe {
            while thread.tasks.execute_local(&thread, ptr::null()) {}
        }
        self.any_tasks_running.fetch_sub(1, Ordering::SeqCst);

        crate::core::remove_scheduler(self);
        trace!("root task drained");

        self.thread_local[thread_index].store(ptr::null_mut(), Ordering::Release);
        swap_thread(previous);

        self.exit_barrier();

        if let Some(payload) = self.cancelling_panic.take() {
            panic::resume_unwind(payload);
        }
    }

    /// Enroll the calling thread as a worker until the scheduler drains.
    ///
    /// Blocks until a root task has been submitted, helps execute it, and
    /// resumes the first captured failure, if any, on the caller.
    pub fn join(self: &Arc<Self>) {
        let thread_index;
        {
            let mut guard = self.mutex.lock().unwrap();
            thread_index = self.alloc_thread_index();
            while !self.has_root_task.load(Ordering::Acquire) {
                guard = self.condition.wait(guard).unwrap();
            }
        }

        self.thread_loop(thread_index);

        if let Some(payload) = self.cancelling_panic.take() {
            panic::resume_unwind(payload);
        }
    }

    /// Worker loop for one enrollment: drain local tasks, steal otherwise,
    /// until no worker is executing tasks and nothing is left to steal.
    pub(crate) fn thread_loop(self: &Arc<Self>, thread_index: usize) {
        let thread = AliasableBox::from_unique(Box::new(Thread::new(thread_index, self.clone())));
        self.thread_local[thread_index]
            .store(&*thread as *const Thread as *mut Thread, Ordering::Release);
        let previous = swap_thread(&*thread);

        while self.any_tasks_running.load(Ordering::SeqCst) > 0 {
            self.steal_loop(
                &thread,
                || self.any_tasks_running.load(Ordering::SeqCst) > 0,
                || {
                    self.any_tasks_running.fetch_add(1, Ordering::SeqCst);
                    unsafe {
                        while thread.tasks.execute_local(&thread, ptr::null()) {}
                    }
                    self.any_tasks_running.fetch_sub(1, Ordering::SeqCst);
                },
            );
        }

        self.thread_local[thread_index].store(ptr::null_mut(), Ordering::Release);
        swap_thread(previous);

        self.exit_barrier();
    }

    /// Leave the scheduler and wait until every enrolled peer has left too.
    ///
    /// Peers may still be reading our thread table slot or stealing from our
    /// queue while they wind down, so the `Thread` allocation must not be
    /// released before the counter hits zero.
    fn exit_barrier(&self) {
        self.thread_counter.fetch_sub(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.thread_counter.load(Ordering::SeqCst) > 0 {
            backoff.snooze();
        }
    }

    /// Repeatedly try to steal work while `pred` holds, running `body` after
    /// every successful steal.
    ///
    /// Bursts of spin attempts, desynchronized across workers by striding
    /// with the enrolled thread count, are separated by OS yields. The
    /// predicate is the only exit; callers must guarantee that it eventually
    /// turns false.
    pub(crate) fn steal_loop<P, B>(&self, thread: &Thread, pred: P, mut body: B)
    where
        P: Fn() -> bool,
        B: FnMut(),
    {
        loop {
            // Some rounds that yield.
            let mut round = 0;
            while round < 32 {
                // Some spinning rounds.
                let stride = self.thread_counter.load(Ordering::Relaxed).max(1);
                let mut spin = 0;
                while spin < 1024 {
                    if !pred() {
                        return;
                    }
                    if self.steal_from_other_threads(thread) {
                        round = 0;
                        spin = 0;
                        body();
                    }
                    spin += stride;
                }
                thread::yield_now();
                round += 1;
            }
        }
    }

    /// Walk the other enrolled threads, starting after ours and wrapping,
    /// and try to steal one task. Returns true at the first success.
    pub(crate) fn steal_from_other_threads(&self, thread: &Thread) -> bool {
        let thread_index = thread.thread_index;
        let thread_count = self.thread_counter.load(Ordering::Acquire);

        for i in 1..thread_count {
            pause_cpu(32);
            let mut other_index = thread_index + i;
            if other_index >= thread_count {
                other_index -= thread_count;
            }

            let other = self.thread_local[other_index].load(Ordering::Acquire);
            if other.is_null() {
                continue;
            }

            unsafe {
                // Not worth the claim traffic if the peer has nothing.
                if (*other).tasks.task_size_at_left() == 0 {
                    continue;
                }
                if (*other).tasks.steal(thread) {
                    return true;
                }
            }
        }

        false
    }
}

/// Drain the current thread's local queue until the task it is waiting on
/// is reached.
///
/// Returns false if the scheduler is cancelling, in which case the caller
/// should stop spawning further work.
pub(crate) fn wait_for_children() -> bool {
    let thread = current_thread();
    if thread.is_null() {
        return true;
    }
    unsafe {
        loop {
            let awaiting = (*thread).task.get();
            if !(*thread).tasks.execute_local(&*thread, awaiting) {
                break;
            }
        }
        !(*thread).scheduler().is_cancelled()
    }
}

#[cfg(test)]
use std::panic::AssertUnwindSafe;
#[cfg(test)]
use std::sync::atomic::AtomicUsize as Counter;

#[test]
fn parallel_sum() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(4, false);

    let sum = Counter::new(0);
    let sum = &sum;
    crate::core::spawn_root_and_wait(|| {
        for i in 1..=1000usize {
            unsafe {
                crate::core::spawn(move || {
                    sum.fetch_add(i, Ordering::Relaxed);
                });
            }
        }
        assert!(crate::core::wait());
    });
    assert_eq!(sum.load(Ordering::Relaxed), 500500);

    crate::core::destroy();
}

#[test]
fn nested_fork_join() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(4, false);

    let runs = [
        Counter::new(0),
        Counter::new(0),
        Counter::new(0),
        Counter::new(0),
    ];
    let runs = &runs;
    crate::core::spawn_root_and_wait(|| {
        for child in 0..2usize {
            unsafe {
                crate::core::spawn(move || {
                    for grandchild in 0..2usize {
                        let leaf = child * 2 + grandchild;
                        unsafe {
                            crate::core::spawn(move || {
                                runs[leaf].fetch_add(1, Ordering::Relaxed);
                            });
                        }
                    }
                    assert!(crate::core::wait());
                });
            }
        }
        assert!(crate::core::wait());
    });

    // Every leaf ran exactly once.
    for leaf in runs {
        assert_eq!(leaf.load(Ordering::Relaxed), 1);
    }

    crate::core::destroy();
}

#[test]
fn panic_propagation() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(4, false);

    let executed = Counter::new(0);
    let executed = &executed;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        crate::core::spawn_root_and_wait(|| {
            for i in 0..100usize {
                unsafe {
                    crate::core::spawn(move || {
                        if i == 42 {
                            panic!("boom");
                        }
                        executed.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }
            crate::core::wait();
        });
    }));

    // The payload surfaces to the submitter unchanged.
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("boom"));
    // The failing task is not counted, and tasks claimed after the failure
    // was recorded drain without executing.
    assert!(executed.load(Ordering::Relaxed) <= 99);

    // The sticky scheduler was reset on the unwind path and accepts the
    // next submission from this thread.
    let again = Counter::new(0);
    let again = &again;
    crate::core::spawn_root_and_wait(|| {
        for _ in 0..10usize {
            unsafe {
                crate::core::spawn(move || {
                    again.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        assert!(crate::core::wait());
    });
    assert_eq!(again.load(Ordering::Relaxed), 10);

    crate::core::destroy();
}

#[test]
fn two_schedulers_share_the_pool() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(4, false);

    let spawn_tree = |counter: Arc<Counter>| {
        thread::spawn(move || {
            let scheduler = Arc::new(TaskScheduler::new());
            let counter = &counter;
            scheduler.spawn_root(100_000, || {
                for _ in 0..100usize {
                    unsafe {
                        crate::core::spawn_sized(1000, move || {
                            for _ in 0..1000usize {
                                unsafe {
                                    crate::core::spawn(move || {
                                        counter.fetch_add(1, Ordering::Relaxed);
                                    });
                                }
                            }
                            assert!(crate::core::wait());
                        });
                    }
                }
                assert!(crate::core::wait());
            });
        })
    };

    let a = Arc::new(Counter::new(0));
    let b = Arc::new(Counter::new(0));
    let submitter_a = spawn_tree(a.clone());
    let submitter_b = spawn_tree(b.clone());
    submitter_a.join().unwrap();
    submitter_b.join().unwrap();

    assert_eq!(a.load(Ordering::Relaxed), 100_000);
    assert_eq!(b.load(Ordering::Relaxed), 100_000);

    crate::core::destroy();
}

#[test]
fn join_helps_drain() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(2, false);

    let scheduler = Arc::new(TaskScheduler::new());
    let done = Arc::new(Counter::new(0));

    let joiner = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.join();
        })
    };

    let done_ref = &done;
    scheduler.spawn_root(2000, || {
        for _ in 0..2000usize {
            unsafe {
                crate::core::spawn(move || {
                    done_ref.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        assert!(crate::core::wait());
    });

    joiner.join().unwrap();
    assert_eq!(done.load(Ordering::Relaxed), 2000);
    scheduler.reset();

    crate::core::destroy();
}

#[test]
fn spawn_outside_tasks_runs_as_root() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(2, false);

    let ran = Counter::new(0);
    let ran = &ran;
    unsafe {
        crate::core::spawn(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    // With no current task, the spawn ran as a root and completed before
    // returning.
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    crate::core::destroy();
}

// A task that returns with queued, un-waited children corrupts the queue
// protocol, which the scheduler treats as fatal. Aborts are observed from a
// child process.
#[test]
fn structural_violation_aborts() {
    if std::env::var("SPINDLE_STRUCTURAL_VIOLATION").is_ok() {
        crate::core::create(4, false);
        crate::core::spawn_root_and_wait(|| {
            unsafe {
                crate::core::spawn(|| {});
            }
            // The missing wait() here is the bug under test.
        });
        return;
    }

    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .arg("core::scheduler::structural_violation_aborts")
        .arg("--exact")
        .arg("--nocapture")
        .env("SPINDLE_STRUCTURAL_VIOLATION", "1")
        .status()
        .unwrap();
    assert!(!status.success());
}
