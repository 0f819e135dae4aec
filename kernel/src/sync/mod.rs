//! Synchronization primitives.
//!
//! The kernel-wide lock ordering is PMM < MMU < address-space < slab <
//! scheduler; acquiring in the reverse order is a bug.

pub mod refcount;
pub mod spinlock;

pub use refcount::RefCount;
pub use spinlock::{SpinLock, SpinLockGuard};
