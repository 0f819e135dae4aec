//! Scheduler state machine.
//!
//! Single CPU, preemptive, priority-free round robin. The struct here is
//! pure bookkeeping: queue and sleep-list manipulation, slice accounting,
//! dead-thread reaping. The facade in [`super`] wires it to interrupts
//! and the context-switch primitive; tests drive it directly.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::timer::TIME_SLICE_TICKS;

use super::queue::ReadyQueue;
use super::thread::{Thread, ThreadState};

/// One sleeping thread, keyed by its absolute wake tick.
struct SleepEntry {
    wake_tick: u64,
    thread: Arc<Thread>,
}

/// Scheduler bookkeeping. All methods expect interrupts to be off (the
/// facade wraps the instance in an IRQ spinlock).
pub struct Scheduler {
    ready: ReadyQueue,
    /// Sorted by wake tick; stable for equal ticks (FIFO).
    sleepers: Vec<SleepEntry>,
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    /// Threads observed dead at dispatch, pending final teardown.
    reaped: Vec<Arc<Thread>>,
    need_resched: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: ReadyQueue::new(),
            sleepers: Vec::new(),
            current: None,
            idle: None,
            reaped: Vec::new(),
            need_resched: false,
        }
    }

    /// Register the idle thread. It is dispatched only when the ready
    /// queue is empty and never enqueued itself.
    pub fn set_idle(&mut self, idle: Arc<Thread>) {
        self.idle = Some(idle);
    }

    pub fn set_current(&mut self, thread: Arc<Thread>) {
        self.current = Some(thread);
    }

    pub fn current(&self) -> Option<Arc<Thread>> {
        self.current.clone()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn sleeper_count(&self) -> usize {
        self.sleepers.len()
    }

    fn is_idle(&self, thread: &Arc<Thread>) -> bool {
        self.idle
            .as_ref()
            .map(|idle| Arc::ptr_eq(idle, thread))
            .unwrap_or(false)
    }

    /// Make a thread runnable.
    pub fn enqueue(&mut self, thread: Arc<Thread>) -> bool {
        if thread.is_killed() {
            self.reaped.push(thread);
            return false;
        }
        if self.is_idle(&thread) {
            return false;
        }
        thread.set_state(ThreadState::Running);
        self.ready.enqueue(thread)
    }

    /// Next thread to dispatch. Killed threads found at the queue head
    /// are moved to the reap list and skipped; with nothing ready, the
    /// idle thread runs.
    pub fn pick_next(&mut self) -> Option<Arc<Thread>> {
        while let Some(thread) = self.ready.dequeue() {
            if thread.is_killed() {
                self.reaped.push(thread);
                continue;
            }
            return Some(thread);
        }
        self.idle.clone()
    }

    /// Park `thread` until `wake_tick`. Insertion keeps the list sorted
    /// and FIFO-stable for equal ticks.
    pub fn sleep_until(&mut self, thread: Arc<Thread>, wake_tick: u64) {
        thread.set_state(ThreadState::Waiting);
        thread.set_wake_tick(wake_tick);
        let at = self
            .sleepers
            .partition_point(|entry| entry.wake_tick <= wake_tick);
        self.sleepers.insert(at, SleepEntry { wake_tick, thread });
    }

    /// Wake every sleeper whose tick has been reached. Killed sleepers
    /// go to the reap list instead of the ready queue.
    pub fn wake_expired(&mut self, now: u64) -> usize {
        let mut woken = 0;
        while self
            .sleepers
            .first()
            .map(|entry| entry.wake_tick <= now)
            .unwrap_or(false)
        {
            let entry = self.sleepers.remove(0);
            if self.enqueue(entry.thread) {
                woken += 1;
            }
        }
        woken
    }

    /// Timer-tick bookkeeping: wake sleepers, check the current slice.
    /// Returns whether the caller should reschedule (slice expired and
    /// preemption not held off).
    pub fn on_tick(&mut self, now: u64, preempt_held: bool) -> bool {
        self.wake_expired(now);

        match &self.current {
            Some(current) if self.is_idle(current) => {
                // Idle yields as soon as real work shows up.
                if !self.ready.is_empty() {
                    self.need_resched = true;
                }
            }
            Some(current) => {
                if current.preempt_deadline() <= now {
                    self.need_resched = true;
                }
            }
            None => self.need_resched = true,
        }
        // A held preemption level defers the switch; the flag stays set
        // so the next opportunity reschedules.
        self.need_resched && !preempt_held
    }

    /// Pick the next thread and rotate the current one out.
    ///
    /// Returns `(previous, next)` when a switch is required; `None` when
    /// the current thread simply keeps running. A previous thread that
    /// is still runnable goes to the queue tail.
    pub fn switch_select(&mut self, now: u64) -> Option<(Option<Arc<Thread>>, Arc<Thread>)> {
        self.need_resched = false;
        let next = self.pick_next()?;

        if let Some(current) = &self.current {
            if Arc::ptr_eq(current, &next) {
                next.set_preempt_deadline(now + TIME_SLICE_TICKS);
                return None;
            }
        }

        let previous = self.current.replace(next.clone());
        next.set_preempt_deadline(now + TIME_SLICE_TICKS);

        if let Some(prev) = &previous {
            if prev.state() == ThreadState::Running && !self.is_idle(prev) {
                self.ready.enqueue(prev.clone());
            } else if prev.is_killed() {
                self.reaped.push(prev.clone());
            }
        }

        Some((previous, next))
    }

    /// Drain threads whose dispatch attempt found them dead; the caller
    /// performs teardown outside the scheduler lock.
    pub fn take_reaped(&mut self) -> Vec<Arc<Thread>> {
        core::mem::take(&mut self.reaped)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
