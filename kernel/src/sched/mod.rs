//! Preemptive round-robin scheduling.
//!
//! [`scheduler`] holds the pure state machine; this module owns the
//! global instance, the preemption level, and the glue to the timer
//! interrupt and the context-switch primitive. Last in the kernel lock
//! order: code holding the scheduler lock may take any lower lock.

extern crate alloc;

pub mod queue;
pub mod scheduler;
pub mod semaphore;
pub mod thread;
pub mod wait_queue;
pub mod worker;

pub use scheduler::Scheduler;
pub use semaphore::Semaphore;
pub use thread::{Thread, ThreadId, ThreadState};
pub use wait_queue::WaitQueue;
pub use worker::Worker;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::{self, IrqState};
use crate::sync::SpinLock;

static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

/// Re-entrant preemption hold-off counter.
static PREEMPT_LEVEL: AtomicUsize = AtomicUsize::new(0);

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Run `f` under the scheduler lock.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    f(&mut SCHEDULER.lock())
}

/// The currently running thread, if the scheduler is up.
pub fn current() -> Option<Arc<Thread>> {
    SCHEDULER.lock().current()
}

/// Enter a no-preemption section: bump the level and mask interrupts.
/// Returns the previous interrupt state for [`preempt_enable`].
pub fn preempt_disable() -> IrqState {
    PREEMPT_LEVEL.fetch_add(1, Ordering::AcqRel);
    arch::irq_save_disable()
}

/// Leave a no-preemption section opened by [`preempt_disable`].
pub fn preempt_enable(prev: IrqState) {
    let level = PREEMPT_LEVEL.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(level > 0, "preempt_enable without preempt_disable");
    arch::irq_restore(prev);
}

pub fn preempt_level() -> usize {
    PREEMPT_LEVEL.load(Ordering::Acquire)
}

/// Timer-interrupt hook: sleep-list wakeups plus slice accounting.
/// Reschedules unless a preemption section is held (the pending switch
/// then fires when the section ends).
pub fn timer_tick(now: u64) {
    if !INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    let should_resched = SCHEDULER.lock().on_tick(now, preempt_level() > 0);
    if should_resched {
        schedule();
    }
}

/// Voluntary (or slice-forced) reschedule point.
pub fn schedule() {
    let irq = arch::irq_save_disable();
    let switch = SCHEDULER.lock().switch_select(crate::timer::ticks());
    reap();

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    if let Some((prev, next)) = switch {
        // SAFETY: interrupts are off and the scheduler lock is released;
        // prev/next contexts are exclusively ours until the switch lands.
        unsafe { do_switch(prev, next) };
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = switch;

    arch::irq_restore(irq);
}

/// Tear down threads whose dispatch attempt found them killed.
fn reap() {
    let dead = SCHEDULER.lock().take_reaped();
    for thread in dead {
        let context = thread.context();
        if context.kstack_phys.as_usize() != 0 {
            let _ = crate::mm::PMM
                .lock()
                .free_pages(context.kstack_phys, context.kstack_size);
        }
        crate::process::thread_exited(&thread);
    }
}

/// Park the current thread until the tick counter reaches `wake_tick`.
pub fn sleep_until(wake_tick: u64) {
    let irq = arch::irq_save_disable();
    if let Some(current) = current() {
        SCHEDULER.lock().sleep_until(current, wake_tick);
        schedule();
    }
    arch::irq_restore(irq);
}

/// Block the current thread on `queue` and yield.
pub fn wait_on(queue: &WaitQueue) {
    let irq = arch::irq_save_disable();
    if let Some(current) = current() {
        queue.block_thread(current);
        schedule();
    }
    arch::irq_restore(irq);
}

/// Wake the longest waiter of `queue` into the ready queue.
pub fn wake_one(queue: &WaitQueue) -> bool {
    with_scheduler(|sched| queue.wake_one_into(sched))
}

/// Wake every waiter of `queue`.
pub fn wake_all(queue: &WaitQueue) -> usize {
    with_scheduler(|sched| queue.wake_all_into(sched))
}

/// Mark a thread killed. Teardown happens at its next dispatch attempt;
/// killing the current thread yields immediately.
pub fn thread_kill(thread: &Arc<Thread>) {
    thread.set_state(ThreadState::Killed);
    let is_current = current()
        .map(|cur| Arc::ptr_eq(&cur, thread))
        .unwrap_or(false);
    if is_current {
        schedule();
    }
}

// ---------------------------------------------------------------------------
// Bare-metal bring-up: stacks, switch frames, the idle thread
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use super::*;
    use crate::error::KernelResult;
    use crate::mm::{AllocFlags, PhysicalAddress};

    /// Kernel stack size for spawned threads.
    const KSTACK_SIZE: usize = 16 * 1024;

    /// Saved stack-pointer slot for the boot flow's very first switch.
    static mut BOOT_KSP: usize = 0;

    /// Allocate a kernel stack and build the first-entry switch frame.
    pub(super) fn make_kernel_thread(
        name: &str,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> KernelResult<Arc<Thread>> {
        let phys = crate::mm::PMM
            .lock()
            .allocate_pages(KSTACK_SIZE, AllocFlags::KERNEL)?;
        let thread = Thread::new(name, 0, true);
        let top = crate::mm::phys_to_virt(phys.offset(KSTACK_SIZE)) as *mut usize;
        // SAFETY: the stack run was just allocated for this thread; the
        // context is untouched until the scheduler dispatches it.
        unsafe {
            let ksp = crate::arch::x86::context::initial_stack(top, entry, arg);
            let context = thread.context_ptr();
            (*context).ksp = ksp;
            (*context).kstack_phys = phys;
            (*context).kstack_size = KSTACK_SIZE;
            (*context).page_directory =
                crate::mm::address_space::kernel_space().lock().page_directory();
        }
        Ok(thread)
    }

    /// Spawn a kernel thread and make it runnable.
    pub fn spawn_kernel(
        name: &str,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> KernelResult<Arc<Thread>> {
        let thread = make_kernel_thread(name, entry, arg)?;
        with_scheduler(|sched| sched.enqueue(thread.clone()));
        Ok(thread)
    }

    extern "C" fn idle_entry(_: usize) -> ! {
        crate::arch::x86::cpu::idle_loop()
    }

    /// Install the boot flow as the current thread and create the idle
    /// thread. Panics on failure: a kernel without a scheduler cannot
    /// continue.
    pub fn init() {
        let boot = Thread::new("boot", 0, true);
        // SAFETY: the boot thread's context belongs to the running flow.
        unsafe {
            (*boot.context_ptr()).page_directory = arch::current_page_directory();
        }
        let idle = make_kernel_thread("idle", idle_entry, 0)
            .expect("failed to create the idle thread");
        {
            let mut sched = SCHEDULER.lock();
            sched.set_idle(idle);
            sched.set_current(boot);
        }
        INITIALIZED.store(true, Ordering::Release);
        log::info!("scheduler: round-robin, {} tick slice", crate::timer::TIME_SLICE_TICKS);
    }

    /// Hand the CPU to the scheduler: the boot thread becomes a halt
    /// loop that the timer preempts.
    pub fn start() -> ! {
        crate::arch::x86::cpu::idle_loop()
    }

    /// Switch to `next`, saving the outgoing context.
    ///
    /// # Safety
    ///
    /// Interrupts must be off; `prev`/`next` contexts must not be
    /// reachable by any other executing path.
    pub(super) unsafe fn do_switch(prev: Option<Arc<Thread>>, next: Arc<Thread>) {
        use crate::arch::x86::{context, gdt};

        // SAFETY: scheduler discipline per the function contract.
        unsafe {
            let next_ctx = *next.context_ptr();
            if next_ctx.page_directory != PhysicalAddress::new(0)
                && next_ctx.page_directory != arch::current_page_directory()
            {
                arch::load_page_directory(next_ctx.page_directory);
            }
            if !next.kernel {
                let stack_top = crate::mm::phys_to_virt(
                    next_ctx.kstack_phys.offset(next_ctx.kstack_size),
                ) as usize;
                gdt::set_kernel_stack(stack_top);
            }

            let prev_slot: *mut usize = match &prev {
                Some(prev) => &mut (*prev.context_ptr()).ksp,
                None => &raw mut BOOT_KSP,
            };
            context::switch_context(prev_slot, next_ctx.ksp);
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use boot::{init, spawn_kernel, start};

#[cfg(all(target_arch = "x86", target_os = "none"))]
use boot::do_switch;

/// Mark the scheduler live (test hook for hosted builds).
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn mark_initialized() {
    INITIALIZED.store(true, Ordering::Release);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // The level counter is process-wide, so nesting and interrupt
    // masking are exercised in a single test to keep it race-free under
    // the parallel test harness.
    #[test]
    fn preempt_sections_nest_and_mask_interrupts() {
        let outer = preempt_disable();
        assert!(!crate::arch::irqs_enabled());
        assert!(preempt_level() >= 1);

        let inner = preempt_disable();
        assert!(preempt_level() >= 2);

        preempt_enable(inner);
        assert!(!crate::arch::irqs_enabled(), "inner exit keeps IRQs off");
        preempt_enable(outer);
        assert!(crate::arch::irqs_enabled());
    }
}
