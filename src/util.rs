use crate::core::sync::{AtomicBool, Ordering};

/// Dynamically asserts that sections guarded by `begin`/`end` pairs never
/// overlap.
///
/// The task queue wraps its owner-side sections with one of these: pushing
/// and popping tasks is reserved to the one thread that owns the queue
/// (thieves only touch the steal index), and a `spawn` reaching a queue
/// from the wrong thread trips the check instead of corrupting the deque.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn new() -> Self where T: Default {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag: Default::default(),
        }
    }

    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "exclusive section entered twice: {:?}", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "exclusive section left twice: {:?}", self.tag);
    }
}

/// Report an unrecoverable scheduler error and terminate the process.
///
/// Used for contract violations that leave the task system in a state it
/// cannot recover from: unwinding here would leave other workers spinning on
/// dependencies that can never be met, so we abort instead.
pub(crate) fn fatal_error(msg: &str) -> ! {
    eprintln!("fatal task scheduler error: {}", msg);
    std::process::abort();
}

/// Hint the CPU that we are in a spin-wait, a fixed number of times.
#[inline]
pub(crate) fn pause_cpu(count: u32) {
    for _ in 0..count {
        std::hint::spin_loop();
    }
}

#[test]
fn exclusive_sections_in_sequence() {
    let check: ExclusiveCheck<()> = ExclusiveCheck::new();

    for _ in 0..3 {
        check.begin();
        check.end();
    }
}

#[test]
#[should_panic]
fn overlapping_exclusive_sections() {
    let check = ExclusiveCheck::with_tag("overlap");

    check.begin();
    check.begin();
}
