//! Architecture abstraction layer.
//!
//! Everything privileged (interrupt flag handling, port I/O, control
//! registers, the TLB) is confined to the per-architecture submodule and
//! surfaced as typed primitives. The rest of the kernel is arch-neutral;
//! host builds (unit tests) get no-op stand-ins so the core logic runs
//! off-target.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{
    current_page_directory, halt, idle_loop, init, invlpg, irq_restore, irq_save_disable,
    irqs_enabled, load_page_directory, read_fault_address, tlb_flush_all, IrqState,
};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{
    current_page_directory, halt, idle_loop, init, invlpg, irq_restore, irq_save_disable,
    irqs_enabled, load_page_directory, read_fault_address, tlb_flush_all, IrqState,
};
