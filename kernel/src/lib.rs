//! CinnabarOS kernel library.
//!
//! A small monolithic kernel for 32-bit x86, booted via Multiboot2. The
//! library form exists so the core subsystems (physical and virtual
//! memory, the slab allocator, the scheduler) compile and run on a
//! hosted target for unit testing; the bare-metal binary in `main.rs`
//! links the same code against the boot path.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host target: the standard library backs the unit tests.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
#[cfg(feature = "alloc")]
pub mod dev;
pub mod error;
#[cfg(feature = "alloc")]
pub mod fs;
pub mod logger;
pub mod mm;
#[cfg(feature = "alloc")]
pub mod process;
#[cfg(feature = "alloc")]
pub mod sched;
pub mod serial;
pub mod sync;
#[cfg(feature = "alloc")]
pub mod syscall;
pub mod timer;
pub mod utils;

pub use error::{KernelError, KernelResult};
pub use mm::{FrameNumber, MemoryRegion, PhysicalAddress, VirtualAddress, PAGE_SIZE};
#[cfg(feature = "alloc")]
pub use sched::{Thread, ThreadId, ThreadState};
