//! Thread records.
//!
//! A thread is its kernel stack plus a small record: id, owning process,
//! run state and the saved hardware context. The context is only touched
//! by the scheduler with interrupts disabled, during switches.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::Mapper;
use crate::mm::{phys_to_virt, PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Thread identifier, unique for the kernel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    fn next() -> Self {
        Self(NEXT_TID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Run state. Exactly one of {current, ready-queued, wait-queued or
/// sleeping, killed} describes a live thread; Running covers both the
/// current thread and ready-queue members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Waiting = 1,
    Killed = 2,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Waiting,
            _ => Self::Killed,
        }
    }
}

/// Saved hardware context. `ksp` is the live field across switches; the
/// callee-saved registers live on the kernel stack it points into.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HwContext {
    /// Saved kernel stack pointer.
    pub ksp: usize,
    /// Kernel stack allocation (physical, reached through the window).
    pub kstack_phys: PhysicalAddress,
    pub kstack_size: usize,
    /// Top of the user stack, if the thread has entered user mode.
    pub user_stack_top: VirtualAddress,
    /// Page-directory root to install when this thread runs.
    pub page_directory: PhysicalAddress,
}

impl HwContext {
    pub const fn empty() -> Self {
        Self {
            ksp: 0,
            kstack_phys: PhysicalAddress::new(0),
            kstack_size: 0,
            user_stack_top: VirtualAddress::new(0),
            page_directory: PhysicalAddress::new(0),
        }
    }
}

/// One schedulable thread.
pub struct Thread {
    pub tid: ThreadId,
    pub name: String,
    /// Owning process.
    pub pid: u32,
    /// Kernel-only thread (never enters user mode).
    pub kernel: bool,
    state: AtomicU8,
    /// Absolute tick at which a sleeping thread becomes runnable.
    wake_tick: AtomicU64,
    /// Absolute tick at which the running thread's slice expires.
    preempt_deadline: AtomicU64,
    context: UnsafeCell<HwContext>,
}

// SAFETY: the context cell is only accessed by the scheduler while it
// owns the thread (current or mid-switch) with interrupts disabled;
// every other field is atomic or immutable.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn new(name: &str, pid: u32, kernel: bool) -> Arc<Self> {
        Arc::new(Self {
            tid: ThreadId::next(),
            name: String::from(name),
            pid,
            kernel,
            state: AtomicU8::new(ThreadState::Running as u8),
            wake_tick: AtomicU64::new(0),
            preempt_deadline: AtomicU64::new(0),
            context: UnsafeCell::new(HwContext::empty()),
        })
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.state() == ThreadState::Killed
    }

    pub fn wake_tick(&self) -> u64 {
        self.wake_tick.load(Ordering::Acquire)
    }

    pub fn set_wake_tick(&self, tick: u64) {
        self.wake_tick.store(tick, Ordering::Release);
    }

    pub fn preempt_deadline(&self) -> u64 {
        self.preempt_deadline.load(Ordering::Acquire)
    }

    pub fn set_preempt_deadline(&self, tick: u64) {
        self.preempt_deadline.store(tick, Ordering::Release);
    }

    /// Raw access to the saved context.
    ///
    /// # Safety
    ///
    /// Scheduler only, with interrupts disabled, while no other path can
    /// touch this thread's context.
    pub unsafe fn context_ptr(&self) -> *mut HwContext {
        self.context.get()
    }

    /// Snapshot of the context (scheduler bookkeeping, tests).
    pub fn context(&self) -> HwContext {
        // SAFETY: plain read; racing writes are excluded by the scheduler
        // discipline documented on context_ptr.
        unsafe { *self.context.get() }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Word size used by the user stack layout.
const WORD: usize = core::mem::size_of::<u32>();

/// Copy bytes into user memory through the page tables, page by page.
fn copy_to_user(mapper: &Mapper, dst: VirtualAddress, bytes: &[u8]) -> KernelResult<()> {
    let mut written = 0;
    while written < bytes.len() {
        let virt = dst.offset(written);
        let phys = mapper.translate(virt)?;
        let chunk = (PAGE_SIZE - (virt.as_usize() & (PAGE_SIZE - 1))).min(bytes.len() - written);
        // SAFETY: translate proved the page is mapped; the window makes
        // the frame addressable. The chunk stays inside one page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[written..].as_ptr(),
                phys_to_virt(phys),
                chunk,
            );
        }
        written += chunk;
    }
    Ok(())
}

fn write_user_word(mapper: &Mapper, dst: VirtualAddress, word: u32) -> KernelResult<()> {
    copy_to_user(mapper, dst, &word.to_ne_bytes())
}

/// Lay out the initial user stack for a user-mode jump.
///
/// Growing down from `stack_top`: the packed environment strings, the
/// packed argument strings, the null-terminated envp and argv pointer
/// arrays, then the frame the entry point sees at its stack pointer:
/// `argc`, the argv array address, the envp array address.
///
/// Returns the initial user stack pointer. The stack pages must already
/// be mapped writable.
pub fn build_user_stack(
    mapper: &Mapper,
    stack_top: VirtualAddress,
    argv: &[&str],
    envp: &[&str],
) -> KernelResult<VirtualAddress> {
    let mut cursor = stack_top.as_usize();

    let mut place_strings = |strings: &[&str],
                             cursor: &mut usize|
     -> KernelResult<alloc::vec::Vec<u32>> {
        let mut pointers = alloc::vec::Vec::with_capacity(strings.len());
        for string in strings.iter().rev() {
            *cursor -= string.len() + 1;
            copy_to_user(mapper, VirtualAddress::new(*cursor), string.as_bytes())?;
            copy_to_user(mapper, VirtualAddress::new(*cursor + string.len()), &[0u8])?;
            pointers.push(*cursor as u32);
        }
        pointers.reverse();
        Ok(pointers)
    };

    let env_ptrs = place_strings(envp, &mut cursor)?;
    let arg_ptrs = place_strings(argv, &mut cursor)?;

    cursor &= !(WORD - 1);

    let mut push = |cursor: &mut usize, word: u32| -> KernelResult<()> {
        *cursor -= WORD;
        write_user_word(mapper, VirtualAddress::new(*cursor), word)
    };

    // envp array, null-terminated.
    push(&mut cursor, 0)?;
    for &ptr in env_ptrs.iter().rev() {
        push(&mut cursor, ptr)?;
    }
    let envp_array = cursor as u32;

    // argv array, null-terminated.
    push(&mut cursor, 0)?;
    for &ptr in arg_ptrs.iter().rev() {
        push(&mut cursor, ptr)?;
    }
    let argv_array = cursor as u32;

    push(&mut cursor, envp_array)?;
    push(&mut cursor, argv_array)?;
    push(&mut cursor, argv.len() as u32)?;

    if cursor >= stack_top.as_usize() {
        return Err(KernelError::Inval);
    }
    Ok(VirtualAddress::new(cursor))
}
