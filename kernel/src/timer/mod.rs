//! Kernel tick service.
//!
//! One monotonic counter driven by the PIT at [`HZ`]. The tick hook
//! wakes sleepers and enforces the scheduling time-slice; everything
//! time-related in the kernel is expressed in ticks of this counter.

use core::sync::atomic::{AtomicU64, Ordering};

/// Tick frequency of the PIT channel-0 rate generator.
pub const HZ: u64 = 1000;

/// Round-robin time slice: 2 ms expressed in ticks.
pub const TIME_SLICE_TICKS: u64 = 2 * HZ / 1000;

/// Monotonic tick counter, incremented by the timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Current tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds → ticks, defined as `ms * HZ / 1000`. Sub-tick waits
/// round down to zero and wake on the next tick boundary.
pub const fn ticks_for_ms(ms: u64) -> u64 {
    ms * HZ / 1000
}

/// Monotonic uptime in milliseconds.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / HZ
}

/// Timer-interrupt hook: advance the counter and drive the scheduler
/// (sleep-list wakeups, time-slice accounting).
pub fn on_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    #[cfg(feature = "alloc")]
    crate::sched::timer_tick(now);
}

/// Block the calling thread for at least `ms` milliseconds.
#[cfg(feature = "alloc")]
pub fn timer_wait_ms(ms: u64) {
    let wake_at = ticks() + ticks_for_ms(ms);
    crate::sched::sleep_until(wake_at);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_uses_ms_times_hz() {
        assert_eq!(ticks_for_ms(0), 0);
        assert_eq!(ticks_for_ms(10), 10 * HZ / 1000);
        assert_eq!(ticks_for_ms(1000), HZ);
        // The nominal 2 ms slice is 2 ticks at HZ = 1000.
        assert_eq!(TIME_SLICE_TICKS, 2);
    }

    #[test]
    fn counter_is_monotonic() {
        let before = ticks();
        on_tick();
        on_tick();
        assert!(ticks() >= before + 2);
    }
}
