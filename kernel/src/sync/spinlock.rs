//! IRQ-safe spinlock.
//!
//! A thin layer over `spin::Mutex` that disables interrupts for the
//! duration of the critical section, so the same locks can be taken from
//! interrupt handlers without self-deadlock. The guard restores the
//! previous interrupt state on every exit path.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::arch::{self, IrqState};

/// A mutual-exclusion primitive that masks interrupts while held.
pub struct SpinLock<T: ?Sized> {
    inner: spin::Mutex<T>,
}

/// RAII guard: releases the lock and restores the interrupt state when
/// dropped.
pub struct SpinLockGuard<'a, T: ?Sized> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    irq: IrqState,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Disable interrupts and acquire the lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq = arch::irq_save_disable();
        SpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            irq,
        }
    }

    /// Acquire the lock if it is free, without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq = arch::irq_save_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(SpinLockGuard {
                guard: ManuallyDrop::new(guard),
                irq,
            }),
            None => {
                arch::irq_restore(irq);
                None
            }
        }
    }

    /// Is the lock currently held?
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, before the
        // interrupt state is restored; the lock must not outlive the
        // masked section.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        arch::irq_restore(self.irq);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(v) => f.debug_tuple("SpinLock").field(&&*v).finish(),
            None => f.write_str("SpinLock(<locked>)"),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_gives_exclusive_access() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn guard_restores_irq_state() {
        let lock = SpinLock::new(());
        assert!(crate::arch::irqs_enabled());
        {
            let _guard = lock.lock();
            assert!(!crate::arch::irqs_enabled());
        }
        assert!(crate::arch::irqs_enabled());
    }

    #[test]
    fn try_lock_failure_restores_irq_state() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        assert!(!crate::arch::irqs_enabled());
        drop(guard);
        assert!(crate::arch::irqs_enabled());
    }
}
