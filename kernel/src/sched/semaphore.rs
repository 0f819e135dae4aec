//! Counting semaphore.
//!
//! Built on a wait queue. A blocked acquire parks the caller while still
//! holding the counter lock (via [`WaitQueue::block_releasing`]), so a
//! release racing with the block cannot lose the wakeup.

extern crate alloc;

use alloc::sync::Arc;

use crate::sync::SpinLock;

use super::scheduler::Scheduler;
use super::thread::Thread;
use super::wait_queue::WaitQueue;

pub struct Semaphore {
    count: SpinLock<usize>,
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: usize) -> Self {
        Self {
            count: SpinLock::new(initial),
            queue: WaitQueue::new(),
        }
    }

    /// Take one unit without blocking. Returns whether it succeeded.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// One acquisition step for `thread`: either take a unit, or park
    /// the thread on the queue (atomically with the counter check).
    /// Returns whether the unit was taken; on `false` the caller yields
    /// and retries after wakeup.
    pub fn acquire_or_block(&self, thread: Arc<Thread>) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            self.queue.block_releasing(thread, count);
            false
        }
    }

    /// Return one unit and wake the longest waiter, if any.
    pub fn release_into(&self, sched: &mut Scheduler) {
        {
            let mut count = self.count.lock();
            *count += 1;
        }
        self.queue.wake_one_into(sched);
    }

    /// Block until a unit is available. Kernel context only.
    pub fn acquire(&self) {
        loop {
            let current = super::current().expect("semaphore acquire outside thread context");
            if self.acquire_or_block(current) {
                return;
            }
            super::schedule();
        }
    }

    /// Return one unit (kernel facade).
    pub fn release(&self) {
        super::with_scheduler(|sched| self.release_into(sched));
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }

    pub fn waiters(&self) -> usize {
        self.queue.len()
    }
}
