//! Tasks and their state machine.
//!
//! A task is a one-shot closure plus a small amount of bookkeeping: an atomic
//! state that gates execution, a dependency counter covering the task itself
//! and its spawned children, and a link to its parent. Tasks live in fixed
//! slots of a `TaskQueue` and are shared between the owning worker and
//! thieves through raw pointers, so everything that changes after a task is
//! published goes through atomics.

use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::core::scheduler::Thread;
use crate::core::sync::{AtomicI32, AtomicU32, Ordering};

/// The task has been executed or claimed. Empty slots also read as done.
pub(crate) const STATE_DONE: u32 = 0;
/// The task has been published and nobody has claimed it yet.
pub(crate) const STATE_INITIALIZED: u32 = 1;

/// Marks tasks that don't own an allocation in the closure arena.
pub(crate) const NO_STACK_PTR: usize = usize::MAX;

/// A type-erased, one-shot closure.
///
/// The pointer addresses the closure's storage in a queue's closure arena.
/// `execute` moves the closure out of that storage and calls it;
/// `drop_in_place` releases the captures without calling it. Exactly one of
/// the two happens, exactly once, which the task state machine guarantees.
#[derive(Copy, Clone)]
pub(crate) struct ClosureRef {
    pointer: *mut (),
    execute_fn: unsafe fn(*mut ()),
    drop_fn: unsafe fn(*mut ()),
}

impl ClosureRef {
    /// Erase the type of a closure stored at `pointer`.
    ///
    /// Safety: the storage must stay valid and untouched until the closure is
    /// executed or dropped through the returned ref.
    pub(crate) unsafe fn new<F: FnOnce()>(pointer: *mut F) -> Self {
        unsafe fn execute_erased<F: FnOnce()>(pointer: *mut ()) {
            let closure = ptr::read(pointer as *mut F);
            closure();
        }
        unsafe fn drop_erased<F: FnOnce()>(pointer: *mut ()) {
            ptr::drop_in_place(pointer as *mut F);
        }
        ClosureRef {
            pointer: pointer as *mut (),
            execute_fn: execute_erased::<F>,
            drop_fn: drop_erased::<F>,
        }
    }

    pub(crate) fn noop() -> Self {
        unsafe fn nothing(_: *mut ()) {}
        ClosureRef {
            pointer: ptr::null_mut(),
            execute_fn: nothing,
            drop_fn: nothing,
        }
    }

    pub(crate) unsafe fn execute(self) {
        (self.execute_fn)(self.pointer)
    }

    pub(crate) unsafe fn drop_in_place(self) {
        (self.drop_fn)(self.pointer)
    }
}

pub(crate) struct Task {
    /// Whoever switches this from INITIALIZED to DONE runs the closure.
    state: AtomicU32,
    /// One for the task's own execution plus one per spawned child. The task
    /// is finished when this reaches zero.
    dependencies: AtomicI32,
    /// Stolen copies share the original's closure and must not be stolen a
    /// second time.
    stealable: bool,
    closure: ClosureRef,
    /// The task to notify when the dependency counter reaches zero.
    pub(crate) parent: *mut Task,
    /// Arena top of the owning queue from before this task's closure was
    /// allocated, so that popping the task frees the storage again.
    pub(crate) stack_ptr: usize,
    /// Estimated amount of work. Only a hint for thieves.
    pub(crate) size_hint: usize,
}

impl Task {
    /// The content of unused queue slots.
    pub(crate) fn empty() -> Self {
        Task {
            state: AtomicU32::new(STATE_DONE),
            dependencies: AtomicI32::new(0),
            stealable: false,
            closure: ClosureRef::noop(),
            parent: ptr::null_mut(),
            stack_ptr: NO_STACK_PTR,
            size_hint: 0,
        }
    }

    /// A freshly spawned task, registering itself as a dependency of its
    /// parent.
    pub(crate) unsafe fn new(
        closure: ClosureRef,
        parent: *mut Task,
        stack_ptr: usize,
        size_hint: usize,
    ) -> Self {
        if !parent.is_null() {
            (*parent).add_dependencies(1);
        }
        Task {
            state: AtomicU32::new(STATE_INITIALIZED),
            dependencies: AtomicI32::new(1),
            stealable: true,
            closure,
            parent,
            stack_ptr,
            size_hint,
        }
    }

    /// The stolen copy of a task. The original stays behind in DONE state and
    /// is notified through the parent link when the copy finishes.
    fn stolen(closure: ClosureRef, parent: *mut Task) -> Self {
        Task {
            state: AtomicU32::new(STATE_INITIALIZED),
            dependencies: AtomicI32::new(1),
            stealable: false,
            closure,
            parent,
            stack_ptr: NO_STACK_PTR,
            size_hint: 1,
        }
    }

    pub(crate) fn add_dependencies(&self, n: i32) {
        self.dependencies.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn dependencies(&self) -> i32 {
        self.dependencies.load(Ordering::Acquire)
    }

    fn try_switch_state(&self, from: u32, to: u32) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Run this task, help out until all of its children have completed, then
    /// notify the parent.
    ///
    /// The closure only runs if no thief claimed the task first; the loser of
    /// that race still participates in draining the children. A panic raised
    /// by the closure is captured into the scheduler's cancelling slot, and
    /// while that slot is occupied subsequent closures are released without
    /// running so the scheduler drains.
    pub(crate) unsafe fn run(this: *const Task, thread: &Thread) {
        if (*this).try_switch_state(STATE_INITIALIZED, STATE_DONE) {
            let scheduler = thread.scheduler();
            let previous_task = thread.task.replace(this as *mut Task);
            if !scheduler.is_cancelled() {
                let closure = (*this).closure;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                    closure.execute()
                })) {
                    scheduler.set_cancelling_panic(payload);
                }
            } else {
                (*this).closure.drop_in_place();
            }
            thread.task.set(previous_task);
            (*this).add_dependencies(-1);
        }

        // Steal until all dependencies have completed. Children spawned by
        // the closure were already drained by its `wait` call; what is left
        // at this point are subtrees executing on other threads.
        thread.scheduler().steal_loop(
            thread,
            || unsafe { (*this).dependencies() > 0 },
            || unsafe { while thread.tasks.execute_local(thread, this) {} },
        );

        // Now signal our parent task that we are finished.
        if !(*this).parent.is_null() {
            (*(*this).parent).add_dependencies(-1);
        }
    }

    /// Attempt to claim this task for execution elsewhere. On success a copy
    /// sharing the closure is written to `dst`, a slot in the thief's queue.
    pub(crate) unsafe fn try_steal(this: *const Task, dst: *mut Task) -> bool {
        if !(*this).stealable {
            return false;
        }
        if !(*this).try_switch_state(STATE_INITIALIZED, STATE_DONE) {
            return false;
        }
        ptr::write(dst, Task::stolen((*this).closure, this as *mut Task));
        true
    }
}

#[test]
fn claim_once() {
    let task = unsafe { Task::new(ClosureRef::noop(), ptr::null_mut(), NO_STACK_PTR, 1) };
    assert!(task.try_switch_state(STATE_INITIALIZED, STATE_DONE));
    assert!(!task.try_switch_state(STATE_INITIALIZED, STATE_DONE));
}

#[test]
fn empty_slots_are_done() {
    let task = Task::empty();
    assert!(!task.try_switch_state(STATE_INITIALIZED, STATE_DONE));
    assert_eq!(task.dependencies(), 0);
}

#[test]
fn child_accounting() {
    let parent = unsafe { Task::new(ClosureRef::noop(), ptr::null_mut(), NO_STACK_PTR, 1) };
    let parent_ptr = &parent as *const Task as *mut Task;

    let _child = unsafe { Task::new(ClosureRef::noop(), parent_ptr, NO_STACK_PTR, 1) };
    assert_eq!(parent.dependencies(), 2);

    parent.add_dependencies(-1);
    parent.add_dependencies(-1);
    assert_eq!(parent.dependencies(), 0);
}
