//! Workers: reusable background-task threads.
//!
//! A worker owns a kernel thread looping on its trigger semaphore: each
//! kick runs the job once, wakes anyone waiting for completion, then the
//! worker blocks again.

extern crate alloc;

use core::sync::atomic::{AtomicU64, Ordering};

use super::semaphore::Semaphore;
use super::wait_queue::WaitQueue;

pub struct Worker {
    name: &'static str,
    job: fn(),
    /// One unit per pending kick.
    trigger: Semaphore,
    /// Threads waiting for a completed run.
    done: WaitQueue,
    completed_runs: AtomicU64,
}

impl Worker {
    pub const fn new(name: &'static str, job: fn()) -> Self {
        Self {
            name,
            job,
            trigger: Semaphore::new(0),
            done: WaitQueue::new(),
            completed_runs: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request one run of the job. Safe from interrupt context.
    pub fn kick(&self) {
        self.trigger.release();
    }

    pub fn pending_kicks(&self) -> usize {
        self.trigger.available()
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::Acquire)
    }

    /// One iteration of the worker loop: consume a kick (blocking until
    /// one arrives), run the job, wake completion waiters.
    fn run_once(&self) {
        self.trigger.acquire();
        (self.job)();
        self.completed_runs.fetch_add(1, Ordering::Release);
        super::with_scheduler(|sched| {
            self.done.wake_all_into(sched);
        });
    }

    /// Thread body: loop forever on [`Self::run_once`].
    pub fn run_loop(&self) -> ! {
        loop {
            self.run_once();
        }
    }

    /// Block the calling thread until the next completed run.
    ///
    /// Interrupts stay masked from the run-count snapshot through the
    /// enqueue, so the worker's completion wakeup cannot slip into the
    /// gap and leave the waiter parked forever.
    pub fn wait_for_completion(&self) {
        let irq = crate::arch::irq_save_disable();
        if let Some(current) = super::current() {
            let runs = self.completed_runs();
            self.done.block_thread(current);
            super::schedule();
            debug_assert!(self.completed_runs() >= runs);
        }
        crate::arch::irq_restore(irq);
    }
}

/// Spawn the kernel thread driving `worker`. The worker must be a
/// static: the thread holds the reference forever.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn spawn_worker(worker: &'static Worker) -> crate::error::KernelResult<()> {
    extern "C" fn worker_entry(arg: usize) -> ! {
        // SAFETY: spawn_worker passes a &'static Worker as the argument.
        let worker = unsafe { &*(arg as *const Worker) };
        worker.run_loop();
    }
    super::spawn_kernel(worker.name(), worker_entry, worker as *const Worker as usize)?;
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn nop_job() {}

    #[test]
    fn kicks_accumulate_until_consumed() {
        static WORKER: Worker = Worker::new("test-worker", nop_job);
        WORKER.kick();
        WORKER.kick();
        assert_eq!(WORKER.pending_kicks(), 2);
    }

    #[test]
    fn worker_has_a_name() {
        let worker = Worker::new("flush", nop_job);
        assert_eq!(worker.name(), "flush");
    }
}
