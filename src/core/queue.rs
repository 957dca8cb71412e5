//! The per-thread task deque.
//!
//! The owner pushes and pops on the right in LIFO order, thieves claim slots
//! from the left in FIFO order, so they take the oldest (and usually largest)
//! work while the owner keeps its hot end. The slots are a fixed-capacity
//! array so that in-flight pointers to tasks stay valid; running out of slots
//! is a fatal capacity error rather than a reallocation.
//!
//! Closures are stored out of line in a per-queue bump arena. Each task
//! records the arena top from before its own allocation so that popping the
//! task restores it. This is safe because a task is only popped once its
//! whole subtree has completed, at which point every closure allocated above
//! that mark is dead.

use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::core::scheduler::Thread;
use crate::core::sync::{AtomicUsize, Ordering};
use crate::core::task::{ClosureRef, Task, NO_STACK_PTR};
use crate::util::{fatal_error, ExclusiveCheck};

/// Task slots per thread. Deeper nesting is a fatal capacity error.
pub(crate) const TASK_STACK_SIZE: usize = 4 * 1024;
/// Bytes of closure storage per thread.
pub(crate) const CLOSURE_STACK_SIZE: usize = 512 * 1024;

pub(crate) struct TaskQueue {
    /// Thief end. Slots in `[left, right)` are candidates for stealing.
    /// Thieves claim slots by incrementing this; the owner clamps it back
    /// when it overshoots.
    left: CachePadded<AtomicUsize>,
    /// Owner end. Written by the owner only, acquire-loaded by thieves.
    right: CachePadded<AtomicUsize>,
    tasks: Box<[UnsafeCell<Task>]>,
    /// Bump allocator top for the closure arena. Owner only.
    stack_ptr: Cell<usize>,
    closure_stack: UnsafeCell<Box<[u8]>>,
    /// Owner-side operations must never overlap.
    owner_check: ExclusiveCheck<&'static str>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        TaskQueue {
            left: CachePadded::new(AtomicUsize::new(0)),
            right: CachePadded::new(AtomicUsize::new(0)),
            tasks: (0..TASK_STACK_SIZE)
                .map(|_| UnsafeCell::new(Task::empty()))
                .collect(),
            stack_ptr: Cell::new(0),
            closure_stack: UnsafeCell::new(vec![0u8; CLOSURE_STACK_SIZE].into_boxed_slice()),
            owner_check: ExclusiveCheck::with_tag("task queue owner"),
        }
    }

    /// Bump-allocate closure storage. Owner only.
    unsafe fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        let top = (self.stack_ptr.get() + align - 1) & !(align - 1);
        if top + size > CLOSURE_STACK_SIZE {
            fatal_error("closure arena overflow, the task nesting is too deep");
        }
        self.stack_ptr.set(top + size);
        (*self.closure_stack.get()).as_mut_ptr().add(top)
    }

    /// Push a task on the owner end of the queue.
    ///
    /// Safety: only the owning thread may call this, and the closure (with
    /// everything it borrows) must stay valid until the task has executed,
    /// which the caller guarantees by waiting for spawned children before
    /// returning.
    pub(crate) unsafe fn push_right<F: FnOnce() + Send>(
        &self,
        parent: *mut Task,
        size_hint: usize,
        closure: F,
    ) {
        self.owner_check.begin();

        let right = self.right.load(Ordering::Relaxed);
        if right >= TASK_STACK_SIZE {
            fatal_error("task queue overflow, the task nesting is too deep");
        }

        // Move the closure into the arena. The pre-push arena top travels
        // with the task so that popping it frees the storage again.
        let old_stack_ptr = self.stack_ptr.get();
        let storage = self.alloc(mem::size_of::<F>(), mem::align_of::<F>()) as *mut F;
        ptr::write(storage, closure);

        ptr::write(
            self.tasks[right].get(),
            Task::new(
                ClosureRef::new(storage),
                parent,
                old_stack_ptr,
                size_hint.max(1),
            ),
        );
        self.right.store(right + 1, Ordering::Release);

        // Re-arm the thief end: racing thieves may have run it past the
        // owner end while the queue was empty.
        if self.left.load(Ordering::Acquire) >= right {
            self.left.store(right, Ordering::Release);
        }

        self.owner_check.end();
    }

    /// Execute the task on the owner end, then pop it.
    ///
    /// Returns false without running anything if the queue is empty or the
    /// owner end is `awaiting`, the task the caller is synchronizing on.
    /// Returns whether local tasks remain afterwards.
    pub(crate) unsafe fn execute_local(&self, thread: &Thread, awaiting: *const Task) -> bool {
        let old_right = self.right.load(Ordering::Relaxed);
        if old_right == 0 {
            return false;
        }
        let slot = self.tasks[old_right - 1].get();
        if slot as *const Task == awaiting {
            return false;
        }

        Task::run(slot, thread);
        if self.right.load(Ordering::Relaxed) != old_right {
            fatal_error("a task returned without waiting for its spawned subtasks");
        }

        // Pop the task and release its closure storage.
        self.owner_check.begin();
        let right = old_right - 1;
        self.right.store(right, Ordering::Release);
        if (*slot).stack_ptr != NO_STACK_PTR {
            self.stack_ptr.set((*slot).stack_ptr);
        }
        // Thieves may have run the left pointer past the new owner end.
        if self.left.load(Ordering::Acquire) > right {
            self.left.store(right, Ordering::Release);
        }
        self.owner_check.end();

        right != 0
    }

    /// Attempt to steal the task at the thief end into `thief`'s queue.
    ///
    /// The left index is consumed even when the race for the task is lost;
    /// the loser simply observed a task that was already claimed, and the
    /// owner clamps the index back while popping.
    pub(crate) unsafe fn steal(&self, thief: &Thread) -> bool {
        let left = self.left.load(Ordering::Acquire);
        if left >= self.right.load(Ordering::Acquire) {
            return false;
        }
        let left = self.left.fetch_add(1, Ordering::AcqRel);
        // Concurrent thieves can run the index past the end of the array.
        if left >= TASK_STACK_SIZE {
            return false;
        }

        let dst_right = thief.tasks.right.load(Ordering::Relaxed);
        if dst_right >= TASK_STACK_SIZE {
            // No room to land the stolen copy; the task stays with its owner.
            return false;
        }
        let dst = thief.tasks.tasks[dst_right].get();
        if !Task::try_steal(self.tasks[left].get(), dst) {
            return false;
        }

        thief.tasks.right.store(dst_right + 1, Ordering::Release);
        true
    }

    /// The size hint of the task a thief would claim next, 0 if there is
    /// none. Only a heuristic: the read can race with the owner reusing the
    /// slot.
    pub(crate) fn task_size_at_left(&self) -> usize {
        let left = self.left.load(Ordering::Acquire);
        if left >= self.right.load(Ordering::Acquire) {
            return 0;
        }
        unsafe { (*self.tasks[left].get()).size_hint }
    }
}

#[cfg(test)]
use crate::core::scheduler::TaskScheduler;
#[cfg(test)]
use crate::core::sync::{Arc, Mutex};
#[cfg(test)]
use crate::core::sync::AtomicUsize as TestCounter;

#[test]
fn local_lifo_order() {
    let scheduler = Arc::new(TaskScheduler::new());
    let thread = Thread::new(0, scheduler);
    let order = Mutex::new(Vec::new());
    let order = &order;

    unsafe {
        for i in 0..3u32 {
            thread.tasks.push_right(ptr::null_mut(), 1, move || {
                order.lock().unwrap().push(i);
            });
        }
        while thread.tasks.execute_local(&thread, ptr::null()) {}
    }

    // The owner drains its own end in LIFO order.
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    assert_eq!(thread.tasks.right.load(Ordering::Relaxed), 0);
    assert_eq!(thread.tasks.left.load(Ordering::Relaxed), 0);
}

#[test]
fn arena_restored_after_drain() {
    let scheduler = Arc::new(TaskScheduler::new());
    let thread = Thread::new(0, scheduler);
    let sink = TestCounter::new(0);
    let sink = &sink;

    unsafe {
        for _ in 0..8 {
            let payload = [7u8; 200];
            thread.tasks.push_right(ptr::null_mut(), 1, move || {
                sink.fetch_add(payload[0] as usize, Ordering::Relaxed);
            });
        }
        assert!(thread.tasks.stack_ptr.get() >= 8 * 200);
        while thread.tasks.execute_local(&thread, ptr::null()) {}
    }

    assert_eq!(sink.load(Ordering::Relaxed), 8 * 7);
    assert_eq!(thread.tasks.stack_ptr.get(), 0);
}

#[test]
fn steal_from_the_left() {
    let scheduler = Arc::new(TaskScheduler::new());
    let owner = Thread::new(0, scheduler.clone());
    let thief = Thread::new(1, scheduler);
    let count = TestCounter::new(0);

    unsafe {
        owner.tasks.push_right(ptr::null_mut(), 3, || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        owner.tasks.push_right(ptr::null_mut(), 1, || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        // Thieves see the oldest task first.
        assert_eq!(owner.tasks.task_size_at_left(), 3);
        assert!(owner.tasks.steal(&thief));
        assert_eq!(owner.tasks.left.load(Ordering::Relaxed), 1);

        // Drain the thief first: the stolen copy notifies the abandoned
        // original through its parent link, letting the owner's pass over
        // that slot complete without spinning.
        while thief.tasks.execute_local(&thief, ptr::null()) {}
        while owner.tasks.execute_local(&owner, ptr::null()) {}
    }

    // Both closures ran, each exactly once.
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn losing_the_claim_race() {
    let scheduler = Arc::new(TaskScheduler::new());
    let owner = Thread::new(0, scheduler.clone());
    let thief_a = Thread::new(1, scheduler.clone());
    let thief_b = Thread::new(2, scheduler);
    let count = TestCounter::new(0);
    let count = &count;

    unsafe {
        owner.tasks.push_right(ptr::null_mut(), 1, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        assert!(owner.tasks.steal(&thief_a));
        // Rewind the claim index so a second thief races for the same slot.
        owner.tasks.left.store(0, Ordering::SeqCst);

        // The claim consumes the index again, but the slot was already won;
        // there is no rollback and nothing lands in the loser's queue.
        assert!(!owner.tasks.steal(&thief_b));
        assert_eq!(owner.tasks.left.load(Ordering::SeqCst), 1);
        assert_eq!(thief_b.tasks.right.load(Ordering::Relaxed), 0);

        while thief_a.tasks.execute_local(&thief_a, ptr::null()) {}
        while owner.tasks.execute_local(&owner, ptr::null()) {}
    }

    assert_eq!(count.load(Ordering::SeqCst), 1);
}
