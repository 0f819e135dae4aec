//! Wait queues.
//!
//! A spinlocked FIFO of blocked threads. Blocking and waking manipulate
//! thread state here; the yield itself is the facade's job (see
//! [`super::wait_on`]). Wakeups preserve FIFO order within one queue.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::sync::{SpinLock, SpinLockGuard};

use super::scheduler::Scheduler;
use super::thread::{Thread, ThreadState};

/// FIFO of threads blocked on one event.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Mark `thread` waiting and append it. The caller yields afterwards
    /// if it blocked itself.
    pub fn block_thread(&self, thread: Arc<Thread>) {
        thread.set_state(ThreadState::Waiting);
        self.waiters.lock().push_back(thread);
    }

    /// Block `thread` while atomically releasing a caller-held lock: the
    /// thread is enqueued before the guard drops, so a wakeup arriving
    /// the instant the lock is free already finds it here.
    pub fn block_releasing<T>(&self, thread: Arc<Thread>, guard: SpinLockGuard<'_, T>) {
        self.block_thread(thread);
        drop(guard);
    }

    /// Wake the longest-waiting live thread into the ready queue.
    ///
    /// Killed waiters are not removed early; encountering one here is
    /// its dispatch attempt, so it goes to the scheduler's reap list.
    pub fn wake_one_into(&self, sched: &mut Scheduler) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(thread) = waiters.pop_front() {
            if sched.enqueue(thread) {
                return true;
            }
        }
        false
    }

    /// Wake every waiter. Returns how many became runnable.
    pub fn wake_all_into(&self, sched: &mut Scheduler) -> usize {
        let mut woken = 0;
        let mut waiters = self.waiters.lock();
        while let Some(thread) = waiters.pop_front() {
            if sched.enqueue(thread) {
                woken += 1;
            }
        }
        woken
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
