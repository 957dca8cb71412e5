//! The process-wide pool of worker threads.
//!
//! Workers rotate through the attached schedulers, serving the front of the
//! list until its work drains, then picking up the next. Resizing grows the
//! pool by spawning workers and shrinks it by signalling and joining the
//! excess ones; worker exit is driven solely by the running-count so a
//! teardown is just "set it to zero and notify".

use std::mem;

use tracing::{debug, trace};

use crate::core::scheduler::TaskScheduler;
use crate::core::sync::{thread, Arc, AtomicUsize, Condvar, Mutex, Ordering};

// Serializes resizes across all pools in the process. Use a std mutex
// explicitly here because loom's doesn't support static initialization.
static RESIZE_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

struct PoolState {
    /// Workers with a global index at or above this value exit. Only read
    /// and written under the pool mutex, so a worker cannot check it and
    /// then miss a later resize signal while blocking on the condvar.
    num_threads_running: usize,
    /// Whether worker threads have been started.
    running: bool,
    /// Attached scheduling contexts. The front one is served first.
    schedulers: Vec<Arc<TaskScheduler>>,
    /// Join handles of the spawned workers, in thread-index order.
    threads: Vec<thread::JoinHandle<()>>,
}

pub struct ThreadPool {
    /// Configured pool size, including the reserved submitter slot.
    /// Resolved (never 0) once `set_num_threads` has run.
    num_threads: AtomicUsize,
    set_affinity: bool,
    stack_size: usize,
    name_handler: Box<dyn Fn(usize) -> String + Send + Sync>,
    state: Mutex<PoolState>,
    condition: Condvar,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: 0,
            set_affinity: false,
            // Large enough for deeply recursive parallel algorithms.
            stack_size: 4 * 1024 * 1024,
            name_handler: Box::new(|index| format!("Worker#{}", index)),
        }
    }

    /// The configured pool size, including the submitting thread.
    pub fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Acquire)
    }

    /// Ensure the worker threads are spawned. Idempotent.
    pub fn start_threads(self: &Arc<Self>) {
        {
            let state = self.state.lock().unwrap();
            if state.running {
                return;
            }
        }
        self.set_num_threads(self.num_threads(), true);
    }

    /// Set the desired pool size. Grows by spawning workers, shrinks by
    /// signalling and joining the excess ones; a shrink completes once those
    /// workers have finished serving their current scheduler.
    ///
    /// Thread index 0 is reserved for the submitting thread and never
    /// spawned here. `num_threads == 0` means one per logical CPU.
    pub fn set_num_threads(self: &Arc<Self>, num_threads: usize, start_threads: bool) {
        let _resize = RESIZE_MUTEX.lock().unwrap();

        let new_count = if num_threads == 0 {
            num_cpus::get()
        } else {
            num_threads
        };
        self.num_threads.store(new_count, Ordering::Release);

        let active;
        {
            let mut state = self.state.lock().unwrap();
            if !start_threads && !state.running {
                return;
            }
            state.running = true;
            active = state.num_threads_running;
            state.num_threads_running = new_count;
        }
        self.condition.notify_all();

        if new_count > active {
            debug!("growing thread pool from {} to {} threads", active, new_count);
            let mut handles = Vec::with_capacity(new_count - active);
            for global_index in active.max(1)..new_count {
                let pool = self.clone();
                let handle = thread::Builder::new()
                    .name((self.name_handler)(global_index))
                    .stack_size(self.stack_size)
                    .spawn(move || {
                        profiling::register_thread!("Worker");
                        if pool.set_affinity {
                            core_affinity::set_for_current(core_affinity::CoreId {
                                id: global_index,
                            });
                        }
                        pool.thread_loop(global_index);
                    })
                    .unwrap();
                handles.push(handle);
            }
            self.state.lock().unwrap().threads.append(&mut handles);
        } else if new_count < active {
            debug!("shrinking thread pool from {} to {} threads", active, new_count);
            let excess = {
                let mut state = self.state.lock().unwrap();
                let keep = new_count.saturating_sub(1).min(state.threads.len());
                state.threads.split_off(keep)
            };
            for handle in excess {
                let _ = handle.join();
            }
        }
    }

    /// Attach a scheduler. Workers pick it up once the ones before it in the
    /// list have drained.
    pub fn add(&self, scheduler: &Arc<TaskScheduler>) {
        trace!("attaching a scheduler to the thread pool");
        {
            let mut state = self.state.lock().unwrap();
            state.schedulers.push(scheduler.clone());
        }
        self.condition.notify_all();
    }

    /// Detach a scheduler, located by identity.
    pub fn remove(&self, scheduler: &Arc<TaskScheduler>) {
        trace!("detaching a scheduler from the thread pool");
        let mut state = self.state.lock().unwrap();
        if let Some(position) = state
            .schedulers
            .iter()
            .position(|attached| Arc::ptr_eq(attached, scheduler))
        {
            state.schedulers.remove(position);
        }
    }

    /// Worker loop: serve the front scheduler until its work drains, then
    /// pick up the next one, until told to exit.
    fn thread_loop(self: &Arc<Self>, global_index: usize) {
        trace!("worker {} entering the thread pool", global_index);
        loop {
            let (scheduler, thread_index) = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if global_index >= state.num_threads_running {
                        trace!("worker {} exiting the thread pool", global_index);
                        return;
                    }
                    if let Some(scheduler) = state.schedulers.first() {
                        let scheduler = scheduler.clone();
                        let thread_index = scheduler.alloc_thread_index();
                        break (scheduler, thread_index);
                    }
                    state = self.condition.wait(state).unwrap();
                }
            };
            scheduler.thread_loop(thread_index);
        }
    }

    /// Stop and join all workers. Attached schedulers are left in place;
    /// outstanding work on them is the caller's responsibility to have
    /// drained.
    pub fn shut_down(&self) {
        debug!("shutting down the thread pool");
        let threads = {
            let mut state = self.state.lock().unwrap();
            state.num_threads_running = 0;
            state.running = false;
            mem::take(&mut state.threads)
        };
        self.condition.notify_all();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

pub struct ThreadPoolBuilder {
    num_threads: usize,
    set_affinity: bool,
    stack_size: usize,
    name_handler: Box<dyn Fn(usize) -> String + Send + Sync>,
}

impl ThreadPoolBuilder {
    /// `num_threads == 0` means one thread per logical CPU.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;

        self
    }

    /// Bind each worker to the CPU with the same index as the worker.
    pub fn with_affinity(mut self, set_affinity: bool) -> Self {
        self.set_affinity = set_affinity;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.name_handler = Box::new(handler);

        self
    }

    pub fn build(self) -> Arc<ThreadPool> {
        Arc::new(ThreadPool {
            num_threads: AtomicUsize::new(self.num_threads),
            set_affinity: self.set_affinity,
            stack_size: self.stack_size,
            name_handler: self.name_handler,
            state: Mutex::new(PoolState {
                num_threads_running: 0,
                running: false,
                schedulers: Vec::new(),
                threads: Vec::new(),
            }),
            condition: Condvar::new(),
        })
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize as Counter;
#[cfg(test)]
use std::time::Duration;

#[test]
fn start_threads_is_idempotent() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(3, false);

    crate::core::start_threads();
    crate::core::start_threads();

    assert_eq!(crate::core::thread_count(), 3);
    let pool = crate::core::thread_pool().unwrap();
    // A pool of 3 spawns 2 workers, index 0 belongs to the submitter.
    assert_eq!(pool.state.lock().unwrap().threads.len(), 2);

    crate::core::destroy();
}

#[test]
fn builder_configuration_applies() {
    // A standalone pool, configured entirely through the builder rather
    // than through `create`/`set_num_threads`.
    let pool = ThreadPool::builder()
        .with_num_threads(3)
        .with_stack_size(8 * 1024 * 1024)
        .with_thread_names(|index| format!("Spindle#{}", index))
        .build();
    pool.start_threads();

    assert_eq!(pool.num_threads(), 3);
    assert_eq!(pool.stack_size, 8 * 1024 * 1024);
    {
        let state = pool.state.lock().unwrap();
        // A pool of 3 spawns workers 1 and 2, named by the handler.
        assert_eq!(state.threads.len(), 2);
        for (i, handle) in state.threads.iter().enumerate() {
            let expected = format!("Spindle#{}", i + 1);
            assert_eq!(handle.thread().name(), Some(expected.as_str()));
        }
    }

    pool.shut_down();
}

#[test]
fn add_remove_scheduler_round_trip() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(2, false);

    let pool = crate::core::thread_pool().unwrap();
    let before = pool.state.lock().unwrap().schedulers.len();

    let scheduler = Arc::new(TaskScheduler::new());
    pool.add(&scheduler);
    pool.remove(&scheduler);

    assert_eq!(pool.state.lock().unwrap().schedulers.len(), before);

    crate::core::destroy();
}

#[cfg(test)]
fn chain(total: &Counter, depth: usize) {
    total.fetch_add(1, Ordering::Relaxed);
    if depth > 1 {
        unsafe {
            crate::core::spawn(move || chain(total, depth - 1));
        }
        assert!(crate::core::wait());
    }
}

#[test]
fn resize_under_load() {
    let _serial = crate::core::pool_test_lock();
    crate::core::create(8, false);
    crate::core::start_threads();

    let total = Arc::new(Counter::new(0));
    let submitter = {
        let total = total.clone();
        thread::spawn(move || {
            let total = &total;
            crate::core::spawn_root_and_wait(|| chain(total, 256));
        })
    };

    // Shrink while the chain is (most likely still) running. Either way the
    // excess workers drain cleanly and the chain completes.
    std::thread::sleep(Duration::from_millis(5));
    crate::core::create(4, false);

    submitter.join().unwrap();
    assert_eq!(total.load(Ordering::Relaxed), 256);
    assert_eq!(crate::core::thread_count(), 4);
    let pool = crate::core::thread_pool().unwrap();
    assert_eq!(pool.state.lock().unwrap().threads.len(), 3);

    crate::core::destroy();
}

#[test]
fn destroy_is_clean_and_repeatable() {
    let _serial = crate::core::pool_test_lock();

    crate::core::create(2, false);
    crate::core::start_threads();
    crate::core::destroy();
    // A second destroy without a pool is a no-op.
    crate::core::destroy();
    assert_eq!(crate::core::thread_count(), 0);
}
