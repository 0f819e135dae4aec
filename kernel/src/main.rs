//! CinnabarOS kernel binary: Multiboot2 entry and bring-up.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use core::arch::global_asm;
    use core::panic::PanicInfo;

    use cinnabar_kernel::arch::x86::multiboot;
    use cinnabar_kernel::mm::{self, layout, MemoryRegion};
    use cinnabar_kernel::println;

    // Boot stack and entry: the loader leaves the Multiboot2 magic in
    // EAX and the information structure in EBX.
    global_asm!(
        r#"
.section .bss
.align 16
boot_stack_bottom:
    .skip 65536
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, offset boot_stack_top
    push ebx
    push eax
    call kernel_main
"#
    );

    /// Largest boot memory map we accept.
    const MAX_REGIONS: usize = 32;

    #[no_mangle]
    extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
        cinnabar_kernel::serial::init();
        cinnabar_kernel::logger::init(log::LevelFilter::Info);
        println!("CinnabarOS v{}", env!("CARGO_PKG_VERSION"));

        cinnabar_kernel::arch::init();

        if magic != multiboot::MULTIBOOT2_BOOTLOADER_MAGIC {
            panic!("not booted by a Multiboot2 loader (magic {:#x})", magic);
        }
        // SAFETY: the loader contract guarantees a valid information
        // structure at info_addr, identity-reachable during early boot.
        let info = unsafe { multiboot::boot_info(info_addr as usize) }
            .expect("malformed Multiboot2 information structure");

        let mut regions = [MemoryRegion::reserved(0, 0); MAX_REGIONS];
        let count = multiboot::memory_map(&info, &mut regions)
            .expect("boot memory map missing");
        mm::init(&regions[..count]).expect("physical memory init failed");

        mm::heap::init().expect("kernel heap init failed");

        // Kernel address space: fresh directory, full physical window,
        // then switch off the boot stub's tables.
        mm::address_space::init_kernel_space()
            .expect("failed to install the kernel address space");
        {
            let mut space = mm::address_space::kernel_space().lock();
            let mut pmm = mm::PMM.lock();
            space
                .map_kernel_window(&mut pmm)
                .expect("failed to map the kernel window");
            cinnabar_kernel::arch::load_page_directory(space.page_directory());
        }

        mm::slab::init(mm::slab::DEFAULT_BUFCTL_BUCKETS);

        cinnabar_kernel::process::init().expect("process table init failed");
        cinnabar_kernel::sched::init();

        let mut modules = [multiboot::BootModule {
            start: cinnabar_kernel::PhysicalAddress::new(0),
            size: 0,
            name: "",
        }; 8];
        let module_count = multiboot::modules(&info, &mut modules);
        log::info!(
            "boot: {} module(s), root filesystem mount pending",
            module_count
        );

        extern "C" fn init_thread(_: usize) -> ! {
            log::info!("init thread running");
            // Root filesystem mount and the first user process start
            // here once the loader modules are wired through the VFS.
            loop {
                cinnabar_kernel::sched::schedule();
                cinnabar_kernel::arch::halt();
            }
        }
        cinnabar_kernel::sched::spawn_kernel("init", init_thread, 0)
            .expect("failed to spawn the init thread");

        log::info!(
            "entering the scheduler (user space begins at {:#x})",
            layout::USER_BASE
        );
        cinnabar_kernel::sched::start()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo<'_>) -> ! {
        println!("[KERNEL PANIC] {}", info);
        loop {
            cinnabar_kernel::arch::halt();
        }
    }
}

// Hosted stand-in so `cargo build` on a development machine links; the
// kernel only does real work on the bare-metal target.
#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("cinnabar-kernel is a bare-metal binary; build for the i686 target");
}

// Non-x86 bare-metal targets are not supported.
#[cfg(all(not(target_arch = "x86"), target_os = "none"))]
mod unsupported {
    #[panic_handler]
    fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
        loop {}
    }
}
