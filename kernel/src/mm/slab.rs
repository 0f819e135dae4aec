//! Slab object caches.
//!
//! Constant-time allocation of fixed-size objects, layered on page-sized
//! backing from the VM layer. Two classes:
//!
//! * **small** (`obj_size < PAGE_SIZE/8`): the bufctl sits inline right
//!   behind the object and the slab header occupies the tail of the
//!   single page, so an object's slab is found by rounding its address
//!   down to the page base;
//! * **large**: slab headers and bufctls come from the dedicated
//!   bootstrap caches and a hash table maps object address → bufctl.
//!
//! Slabs cycle `free → partial → full → partial → free`; fully empty
//! slabs are retained until an explicit [`KmemCache::shrink`].
//! Constructors run once per object when a slab is grown, destructors
//! when it is destroyed, so cached objects keep their constructed state
//! across free/alloc cycles.
//!
//! Page backing goes through the [`SlabBacking`] seam: the kernel feeds
//! slabs from `vm_alloc` on the kernel address space, the unit tests from
//! host pages.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

use super::{align_down, align_up, PAGE_SIZE};

/// Objects at or above this size use external slab metadata.
pub const SMALL_OBJECT_LIMIT: usize = PAGE_SIZE / 8;

/// Default bucket count of the process-wide bufctl hash. Fixed at boot;
/// the table does not resize.
pub const DEFAULT_BUFCTL_BUCKETS: usize = 1024;

/// Per-object metadata: freelist link (reused as the hash-chain link
/// while the object is handed out), owning slab, and the object address.
#[repr(C)]
pub struct Bufctl {
    next: *mut Bufctl,
    slab: *mut Slab,
    obj: *mut u8,
}

/// One slab: a run of pages carved into objects.
#[repr(C)]
pub struct Slab {
    next: *mut Slab,
    prev: *mut Slab,
    cache: *const KmemCache,
    freelist: *mut Bufctl,
    base: *mut u8,
    color: usize,
    inuse: usize,
    pages: usize,
}

/// Intrusive doubly-linked slab list (one of full/partial/free).
struct SlabList {
    head: *mut Slab,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    fn push(&mut self, slab: *mut Slab) {
        // SAFETY: slabs are owned by the cache whose lock is held; a slab
        // is on at most one list at a time.
        unsafe {
            (*slab).prev = ptr::null_mut();
            (*slab).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
        }
        self.head = slab;
        self.len += 1;
    }

    fn unlink(&mut self, slab: *mut Slab) {
        // SAFETY: as in push; the slab is known to be on this list.
        unsafe {
            let prev = (*slab).prev;
            let next = (*slab).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                debug_assert_eq!(self.head, slab);
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
        }
        self.len -= 1;
    }

    fn pop(&mut self) -> Option<*mut Slab> {
        if self.head.is_null() {
            return None;
        }
        let slab = self.head;
        self.unlink(slab);
        Some(slab)
    }
}

/// Where slab pages come from. The kernel implementation sits on
/// `vm_alloc`; tests substitute host pages.
pub trait SlabBacking {
    /// A page-aligned, zeroed, directly writable run of `pages` pages.
    fn alloc_pages(&mut self, pages: usize) -> KernelResult<NonNull<u8>>;

    /// Return a run obtained from [`Self::alloc_pages`].
    ///
    /// # Safety
    ///
    /// `base` must come from `alloc_pages(pages)` on the same backing and
    /// must no longer be referenced.
    unsafe fn free_pages(&mut self, base: NonNull<u8>, pages: usize);

    /// Record the owning cache on the underlying frames (PMM bookkeeping).
    fn tag_slab(&mut self, _base: NonNull<u8>, _pages: usize, _cache: *const KmemCache) {}

    /// Remove the owning-cache record.
    fn untag_slab(&mut self, _base: NonNull<u8>, _pages: usize) {}
}

/// Process-wide hash from object address to bufctl, used by large
/// caches. Open chaining through `Bufctl::next`; sized once at creation.
pub struct BufctlTable {
    buckets: Vec<*mut Bufctl>,
    entries: usize,
}

// SAFETY: the table is only mutated behind its owner's lock; the raw
// pointers are slab metadata owned by the caches.
unsafe impl Send for BufctlTable {}

impl BufctlTable {
    /// `buckets` is rounded up to a power of two.
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        Self {
            buckets: vec![ptr::null_mut(); buckets],
            entries: 0,
        }
    }

    fn index(&self, obj: *mut u8) -> usize {
        let addr = obj as usize >> 4;
        (addr ^ (addr >> 12)) & (self.buckets.len() - 1)
    }

    fn insert(&mut self, bufctl: *mut Bufctl) {
        // SAFETY: bufctl is live cache metadata; the freelist link is
        // repurposed as the chain link while the object is allocated.
        unsafe {
            let idx = self.index((*bufctl).obj);
            (*bufctl).next = self.buckets[idx];
            self.buckets[idx] = bufctl;
        }
        self.entries += 1;
    }

    fn remove(&mut self, obj: *mut u8) -> Option<*mut Bufctl> {
        let idx = self.index(obj);
        let mut cursor = &mut self.buckets[idx];
        // SAFETY: chain nodes are live bufctls inserted above.
        unsafe {
            while !(*cursor).is_null() {
                let node = *cursor;
                if (*node).obj == obj {
                    *cursor = (*node).next;
                    (*node).next = ptr::null_mut();
                    self.entries -= 1;
                    return Some(node);
                }
                cursor = &mut (*node).next;
            }
        }
        None
    }

    /// Number of currently allocated large objects.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Everything a cache operation needs from its surroundings.
pub struct SlabEnv<'a> {
    pub backing: &'a mut dyn SlabBacking,
    pub hash: &'a mut BufctlTable,
}

/// Cache statistics snapshot, mainly for tests and the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub allocated: usize,
    pub total_slabs: usize,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub free_slabs: usize,
    pub objects_per_slab: usize,
}

struct CacheInner {
    full: SlabList,
    partial: SlabList,
    free: SlabList,
    color_next: usize,
    total_slabs: usize,
    allocated: usize,
}

/// A named cache of fixed-size objects.
pub struct KmemCache {
    name: &'static str,
    obj_size: usize,
    align: usize,
    /// Slot pitch: object plus inline bufctl (small) rounded to `align`.
    obj_real_size: usize,
    slab_pages: usize,
    objects_per_slab: usize,
    /// Unused tail of a slab; colors cycle through it.
    color_range: usize,
    large: bool,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
    inner: SpinLock<CacheInner>,
}

// SAFETY: all mutable state sits behind `inner`'s lock; the raw slab
// pointers it guards are owned by this cache.
unsafe impl Send for KmemCache {}
unsafe impl Sync for KmemCache {}

const fn const_max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

const fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

impl KmemCache {
    /// Lay out a cache for `obj_size`-byte objects. Usable as a static
    /// initializer (the bootstrap caches below are built exactly so).
    pub const fn new(
        name: &'static str,
        obj_size: usize,
        align: usize,
        ctor: Option<fn(*mut u8)>,
        dtor: Option<fn(*mut u8)>,
    ) -> Self {
        let align = const_max(
            const_max(align, align_of::<*mut u8>()),
            1,
        );
        let large = obj_size >= SMALL_OBJECT_LIMIT;

        let (obj_real_size, slab_pages, objects_per_slab, color_range) = if large {
            let real = align_up(obj_size, align);
            // Size slabs for at least eight objects to keep list churn low.
            let pages = ceil_div(real * 8, PAGE_SIZE);
            let usable = pages * PAGE_SIZE;
            (real, pages, usable / real, usable % real)
        } else {
            let real = align_up(obj_size + size_of::<Bufctl>(), align);
            let usable = PAGE_SIZE - size_of::<Slab>();
            (real, 1, usable / real, usable % real)
        };

        Self {
            name,
            obj_size,
            align,
            obj_real_size,
            slab_pages,
            objects_per_slab,
            color_range,
            large,
            ctor,
            dtor,
            inner: SpinLock::new(CacheInner {
                full: SlabList::new(),
                partial: SlabList::new(),
                free: SlabList::new(),
                color_next: 0,
                total_slabs: 0,
                allocated: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.obj_size
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            allocated: inner.allocated,
            total_slabs: inner.total_slabs,
            full_slabs: inner.full.len,
            partial_slabs: inner.partial.len,
            free_slabs: inner.free.len,
            objects_per_slab: self.objects_per_slab,
        }
    }

    /// Allocate one object, growing a fresh slab if no partial or free
    /// slab has room.
    pub fn alloc(&self, env: &mut SlabEnv<'_>) -> KernelResult<NonNull<u8>> {
        let mut inner = self.inner.lock();

        let slab = if !inner.partial.head.is_null() {
            inner.partial.head
        } else if let Some(slab) = inner.free.pop() {
            inner.partial.push(slab);
            slab
        } else {
            let slab = self.grow(&mut inner, env)?;
            inner.partial.push(slab);
            slab
        };

        // SAFETY: the slab came off this cache's lists under the lock; a
        // non-full slab always has a non-empty freelist.
        let obj = unsafe {
            let bufctl = (*slab).freelist;
            debug_assert!(!bufctl.is_null());
            (*slab).freelist = (*bufctl).next;
            (*slab).inuse += 1;
            let obj = (*bufctl).obj;

            if (*slab).freelist.is_null() {
                inner.partial.unlink(slab);
                inner.full.push(slab);
            }
            if self.large {
                (*bufctl).next = ptr::null_mut();
                env.hash.insert(bufctl);
            }
            obj
        };

        inner.allocated += 1;
        NonNull::new(obj).ok_or(KernelError::Nomem)
    }

    /// Return one object to its slab.
    ///
    /// Pointers that do not belong to this cache (foreign objects, double
    /// frees) are rejected with `Inval`.
    pub fn free(&self, env: &mut SlabEnv<'_>, obj: NonNull<u8>) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let obj = obj.as_ptr();

        let (slab, bufctl) = if self.large {
            let bufctl = env.hash.remove(obj).ok_or(KernelError::Inval)?;
            // SAFETY: hash entries are live bufctls for allocated objects.
            let slab = unsafe { (*bufctl).slab };
            // SAFETY: slab headers are live while their cache holds them.
            if unsafe { (*slab).cache } != self as *const _ {
                env.hash.insert(bufctl);
                return Err(KernelError::Inval);
            }
            (slab, bufctl)
        } else {
            self.locate_small(obj)?
        };

        // SAFETY: slab and bufctl were validated to belong to this cache;
        // the cache lock serializes all list and freelist edits.
        unsafe {
            if (*slab).freelist.is_null() {
                inner.full.unlink(slab);
                inner.partial.push(slab);
            }
            (*bufctl).next = (*slab).freelist;
            (*bufctl).slab = slab;
            (*bufctl).obj = obj;
            (*slab).freelist = bufctl;
            (*slab).inuse -= 1;
            if (*slab).inuse == 0 {
                inner.partial.unlink(slab);
                inner.free.push(slab);
            }
        }

        inner.allocated -= 1;
        Ok(())
    }

    /// Resolve a small-cache object pointer to its slab and inline
    /// bufctl, validating ownership on the way.
    fn locate_small(&self, obj: *mut u8) -> KernelResult<(*mut Slab, *mut Bufctl)> {
        let page = align_down(obj as usize, PAGE_SIZE);
        let slab = (page + PAGE_SIZE - size_of::<Slab>()) as *mut Slab;

        // SAFETY: for genuine cache objects this reads our own header;
        // the cache comparison rejects everything else before any list
        // state is touched.
        unsafe {
            if (*slab).cache != self as *const _ {
                return Err(KernelError::Inval);
            }
            let base = (*slab).base as usize + (*slab).color;
            let offset = (obj as usize).wrapping_sub(base);
            if offset % self.obj_real_size != 0 || offset / self.obj_real_size >= self.objects_per_slab
            {
                return Err(KernelError::Inval);
            }

            // Reject a double free: the bufctl must not already be on the
            // freelist. Slabs are small, the walk is bounded.
            let bufctl = (obj as usize + self.obj_real_size - size_of::<Bufctl>()) as *mut Bufctl;
            let mut cursor = (*slab).freelist;
            while !cursor.is_null() {
                if cursor == bufctl {
                    return Err(KernelError::Inval);
                }
                cursor = (*cursor).next;
            }
            Ok((slab, bufctl))
        }
    }

    /// Build a new slab: backing pages, header, colored object carve,
    /// constructors, freelist.
    fn grow(&self, inner: &mut CacheInner, env: &mut SlabEnv<'_>) -> KernelResult<*mut Slab> {
        let base = env.backing.alloc_pages(self.slab_pages)?;

        let color = inner.color_next;
        inner.color_next = if self.color_range == 0 {
            0
        } else {
            (inner.color_next + self.align) % (self.color_range + 1)
        };

        let slab = if self.large {
            match SLAB_CACHE.alloc(env) {
                Ok(ptr) => ptr.as_ptr() as *mut Slab,
                Err(err) => {
                    // SAFETY: base came from this backing just above.
                    unsafe { env.backing.free_pages(base, self.slab_pages) };
                    return Err(err);
                }
            }
        } else {
            (base.as_ptr() as usize + PAGE_SIZE - size_of::<Slab>()) as *mut Slab
        };

        // SAFETY: the header location is ours (tail of our fresh page or
        // a fresh SLAB_CACHE object).
        unsafe {
            slab.write(Slab {
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                cache: self as *const _,
                freelist: ptr::null_mut(),
                base: base.as_ptr(),
                color,
                inuse: 0,
                pages: self.slab_pages,
            });
        }

        // Carve objects back to front so the freelist pops lowest first.
        for index in (0..self.objects_per_slab).rev() {
            let obj = (base.as_ptr() as usize + color + index * self.obj_real_size) as *mut u8;
            let bufctl = if self.large {
                match BUFCTL_CACHE.alloc(env) {
                    Ok(ptr) => ptr.as_ptr() as *mut Bufctl,
                    Err(err) => {
                        self.abort_grow(env, slab, base);
                        return Err(err);
                    }
                }
            } else {
                (obj as usize + self.obj_real_size - size_of::<Bufctl>()) as *mut Bufctl
            };

            // SAFETY: obj and bufctl lie inside the fresh slab pages (or
            // are fresh BUFCTL_CACHE objects); nothing else sees them yet.
            unsafe {
                bufctl.write(Bufctl {
                    next: (*slab).freelist,
                    slab,
                    obj,
                });
                (*slab).freelist = bufctl;
            }
            if let Some(ctor) = self.ctor {
                ctor(obj);
            }
        }

        env.backing.tag_slab(base, self.slab_pages, self as *const _);
        inner.total_slabs += 1;
        Ok(slab)
    }

    /// Unwind a partially built slab after a metadata allocation failure.
    fn abort_grow(&self, env: &mut SlabEnv<'_>, slab: *mut Slab, base: NonNull<u8>) {
        // SAFETY: only grow() calls this, on a slab no list references.
        unsafe {
            if self.large {
                let mut cursor = (*slab).freelist;
                while !cursor.is_null() {
                    let next = (*cursor).next;
                    let _ = BUFCTL_CACHE.free(env, NonNull::new_unchecked(cursor as *mut u8));
                    cursor = next;
                }
                let _ = SLAB_CACHE.free(env, NonNull::new_unchecked(slab as *mut u8));
            }
            env.backing.free_pages(base, self.slab_pages);
        }
    }

    /// Release every fully free slab back to the backing. Returns the
    /// number of slabs destroyed.
    pub fn shrink(&self, env: &mut SlabEnv<'_>) -> usize {
        let mut inner = self.inner.lock();
        let mut destroyed = 0;
        while let Some(slab) = inner.free.pop() {
            self.destroy_slab(env, slab);
            inner.total_slabs -= 1;
            destroyed += 1;
        }
        destroyed
    }

    fn destroy_slab(&self, env: &mut SlabEnv<'_>, slab: *mut Slab) {
        // SAFETY: the slab is fully free (inuse == 0) and unlinked; all
        // of its objects are on the freelist.
        unsafe {
            debug_assert_eq!((*slab).inuse, 0);
            let base = (*slab).base;
            let color = (*slab).color;
            let pages = (*slab).pages;

            if let Some(dtor) = self.dtor {
                for index in 0..self.objects_per_slab {
                    dtor((base as usize + color + index * self.obj_real_size) as *mut u8);
                }
            }

            if self.large {
                let mut cursor = (*slab).freelist;
                while !cursor.is_null() {
                    let next = (*cursor).next;
                    let _ = BUFCTL_CACHE.free(env, NonNull::new_unchecked(cursor as *mut u8));
                    cursor = next;
                }
                let _ = SLAB_CACHE.free(env, NonNull::new_unchecked(slab as *mut u8));
            }

            let base = NonNull::new_unchecked(base);
            env.backing.untag_slab(base, pages);
            env.backing.free_pages(base, pages);
        }
    }
}

// ---------------------------------------------------------------------------
// Bootstrap caches
// ---------------------------------------------------------------------------

/// Cache of cache descriptors; [`kmem_cache_create`] carves from here.
pub static CACHE_CACHE: KmemCache = KmemCache::new(
    "kmem-cache",
    size_of::<KmemCache>(),
    align_of::<KmemCache>(),
    None,
    None,
);

/// Cache of external slab headers for large-object caches.
pub static SLAB_CACHE: KmemCache =
    KmemCache::new("kmem-slab", size_of::<Slab>(), align_of::<Slab>(), None, None);

/// Cache of external bufctls for large-object caches.
pub static BUFCTL_CACHE: KmemCache = KmemCache::new(
    "kmem-bufctl",
    size_of::<Bufctl>(),
    align_of::<Bufctl>(),
    None,
    None,
);

/// Create a cache whose descriptor lives in [`CACHE_CACHE`].
pub fn kmem_cache_create(
    env: &mut SlabEnv<'_>,
    name: &'static str,
    obj_size: usize,
    align: usize,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
) -> KernelResult<NonNull<KmemCache>> {
    if obj_size == 0 {
        return Err(KernelError::Inval);
    }
    let slot = CACHE_CACHE.alloc(env)?.cast::<KmemCache>();
    // SAFETY: slot is a fresh, exclusive CACHE_CACHE object of the right
    // size and alignment.
    unsafe {
        slot.as_ptr()
            .write(KmemCache::new(name, obj_size, align, ctor, dtor));
    }
    Ok(slot)
}

/// Destroy a cache created by [`kmem_cache_create`].
///
/// Fails with `Busy` while objects are still outstanding.
///
/// # Safety
///
/// `cache` must come from [`kmem_cache_create`] and must not be used
/// afterwards.
pub unsafe fn kmem_cache_destroy(
    env: &mut SlabEnv<'_>,
    cache: NonNull<KmemCache>,
) -> KernelResult<()> {
    // SAFETY: per the function contract the pointer is a live cache.
    let cache_ref = unsafe { cache.as_ref() };
    cache_ref.shrink(env);
    let stats = cache_ref.stats();
    if stats.allocated != 0 || stats.total_slabs != 0 {
        return Err(KernelError::Busy);
    }
    CACHE_CACHE.free(env, cache.cast())
}

// ---------------------------------------------------------------------------
// Kernel backing and the global environment
// ---------------------------------------------------------------------------

/// Slab backing over the kernel address space: pages come from
/// `vm_alloc`, are materialized immediately (slab code writes headers
/// right away) and tagged in the PMM.
#[cfg(feature = "alloc")]
pub struct KernelVmBacking;

#[cfg(feature = "alloc")]
impl SlabBacking for KernelVmBacking {
    fn alloc_pages(&mut self, pages: usize) -> KernelResult<NonNull<u8>> {
        use super::address_space::{kernel_space, SegmentFlags};

        let size = pages * PAGE_SIZE;
        let mut space = kernel_space().lock();
        let mut pmm = super::PMM.lock();
        let virt = space.vm_alloc(
            &mut pmm,
            size,
            SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::KERNEL | SegmentFlags::CLEAR,
        )?;
        for offset in (0..size).step_by(PAGE_SIZE) {
            space.fault(&mut pmm, virt.offset(offset), true)?;
        }
        NonNull::new(virt.as_usize() as *mut u8).ok_or(KernelError::Nomem)
    }

    unsafe fn free_pages(&mut self, base: NonNull<u8>, _pages: usize) {
        use super::address_space::kernel_space;

        let mut space = kernel_space().lock();
        let mut pmm = super::PMM.lock();
        let _ = space.vm_free(&mut pmm, super::VirtualAddress::new(base.as_ptr() as usize));
    }

    fn tag_slab(&mut self, base: NonNull<u8>, pages: usize, cache: *const KmemCache) {
        use super::address_space::kernel_space;

        let mut space = kernel_space().lock();
        let mut pmm = super::PMM.lock();
        for page in 0..pages {
            let virt = super::VirtualAddress::new(base.as_ptr() as usize + page * PAGE_SIZE);
            if let Ok(phys) = space.mapper().translate(virt) {
                let _ = pmm.mark_slab(phys.page_base(), 1, cache as usize);
            }
        }
    }

    fn untag_slab(&mut self, base: NonNull<u8>, pages: usize) {
        use super::address_space::kernel_space;

        let mut space = kernel_space().lock();
        let mut pmm = super::PMM.lock();
        for page in 0..pages {
            let virt = super::VirtualAddress::new(base.as_ptr() as usize + page * PAGE_SIZE);
            if let Ok(phys) = space.mapper().translate(virt) {
                let _ = pmm.clear_slab(phys.page_base(), 1);
            }
        }
    }
}

#[cfg(feature = "alloc")]
static BUFCTL_HASH: spin::Once<SpinLock<BufctlTable>> = spin::Once::new();

/// Size the process-wide bufctl hash. Called once at boot, after the
/// kernel address space exists.
#[cfg(feature = "alloc")]
pub fn init(hash_buckets: usize) {
    BUFCTL_HASH.call_once(|| SpinLock::new(BufctlTable::new(hash_buckets)));
}

/// Run `f` with the kernel's slab environment.
///
/// Panics before [`init`]: the slab layer is part of the boot contract.
#[cfg(feature = "alloc")]
pub fn with_kernel_env<R>(f: impl FnOnce(&mut SlabEnv<'_>) -> R) -> R {
    let hash = BUFCTL_HASH.get().expect("slab layer not initialized");
    let mut hash = hash.lock();
    let mut backing = KernelVmBacking;
    let mut env = SlabEnv {
        backing: &mut backing,
        hash: &mut hash,
    };
    f(&mut env)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::alloc::Layout;

    use super::*;

    /// Page-aligned host pages; zeroed like the kernel backing.
    struct HostBacking;

    impl SlabBacking for HostBacking {
        fn alloc_pages(&mut self, pages: usize) -> KernelResult<NonNull<u8>> {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout is non-zero and valid.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            NonNull::new(ptr).ok_or(KernelError::Nomem)
        }

        unsafe fn free_pages(&mut self, base: NonNull<u8>, pages: usize) {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: base came from alloc_pages with the same layout.
            unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
        }
    }

    fn env_parts() -> (HostBacking, BufctlTable) {
        (HostBacking, BufctlTable::new(DEFAULT_BUFCTL_BUCKETS))
    }

    fn consistent(stats: &CacheStats) -> bool {
        stats.full_slabs + stats.partial_slabs + stats.free_slabs == stats.total_slabs
    }

    #[test]
    fn small_cache_alloc_free_churn() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-48", 48, 8, None, None);

        // Alloc 200, free every other one, alloc 100 more.
        let mut objs: Vec<_> = (0..200).map(|_| cache.alloc(&mut env).unwrap()).collect();
        let mut freed = 0;
        for i in (0..200).step_by(2) {
            cache.free(&mut env, objs[i]).unwrap();
            freed += 1;
        }
        assert_eq!(freed, 100);
        for _ in 0..100 {
            objs.push(cache.alloc(&mut env).unwrap());
        }

        let stats = cache.stats();
        assert_eq!(stats.allocated, 200);
        assert!(consistent(&stats), "slab lists inconsistent: {stats:?}");
    }

    #[test]
    fn objects_are_distinct_and_reused() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-32", 32, 8, None, None);

        let a = cache.alloc(&mut env).unwrap();
        let b = cache.alloc(&mut env).unwrap();
        assert_ne!(a, b);

        cache.free(&mut env, a).unwrap();
        let c = cache.alloc(&mut env).unwrap();
        // LIFO freelist: the hot object comes straight back.
        assert_eq!(a, c);
    }

    #[test]
    fn constructor_runs_once_per_slab_lifetime() {
        static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(obj: *mut u8) {
            CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
            // SAFETY: obj points at a fresh object slot.
            unsafe { obj.cast::<u32>().write(0xC0FF_EE00) };
        }

        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-ctor", 64, 8, Some(ctor), None);

        CTOR_RUNS.store(0, Ordering::Relaxed);
        let obj = cache.alloc(&mut env).unwrap();
        let after_first_grow = CTOR_RUNS.load(Ordering::Relaxed);
        assert_eq!(after_first_grow, cache.objects_per_slab());
        // SAFETY: obj is a live object of at least 4 bytes.
        assert_eq!(unsafe { obj.cast::<u32>().as_ref() }, &0xC0FF_EE00);

        // Free/alloc cycles within the slab do not re-run constructors.
        cache.free(&mut env, obj).unwrap();
        let _ = cache.alloc(&mut env).unwrap();
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), after_first_grow);
    }

    #[test]
    fn slab_lists_cycle_free_partial_full() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-cycle", 64, 8, None, None);
        let per_slab = cache.objects_per_slab();

        let objs: Vec<_> = (0..per_slab)
            .map(|_| cache.alloc(&mut env).unwrap())
            .collect();
        let stats = cache.stats();
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);

        cache.free(&mut env, objs[0]).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.full_slabs, 0);
        assert_eq!(stats.partial_slabs, 1);

        for &obj in &objs[1..] {
            cache.free(&mut env, obj).unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.free_slabs, 1);
        assert_eq!(stats.allocated, 0);
        assert!(consistent(&stats));
    }

    #[test]
    fn empty_slabs_are_retained_until_shrink() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-retain", 64, 8, None, None);

        let obj = cache.alloc(&mut env).unwrap();
        cache.free(&mut env, obj).unwrap();
        assert_eq!(cache.stats().free_slabs, 1);

        assert_eq!(cache.shrink(&mut env), 1);
        let stats = cache.stats();
        assert_eq!(stats.total_slabs, 0);
        assert_eq!(stats.free_slabs, 0);
    }

    #[test]
    fn large_cache_uses_the_hash_table() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-1k", 1024, 8, None, None);

        let obj = cache.alloc(&mut env).unwrap();
        // Hash entry exists iff the object is allocated.
        assert_eq!(env.hash.len(), 1);

        cache.free(&mut env, obj).unwrap();
        assert_eq!(env.hash.len(), 0);

        // Second free of the same pointer: no hash entry, rejected.
        assert_eq!(cache.free(&mut env, obj), Err(KernelError::Inval));
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache_a = KmemCache::new("test-a", 48, 8, None, None);
        let cache_b = KmemCache::new("test-b", 48, 8, None, None);

        let obj = cache_a.alloc(&mut env).unwrap();
        assert_eq!(cache_b.free(&mut env, obj), Err(KernelError::Inval));
        // Interior pointers are not object starts either.
        let interior = NonNull::new(unsafe { obj.as_ptr().add(1) }).unwrap();
        assert_eq!(cache_a.free(&mut env, interior), Err(KernelError::Inval));
        cache_a.free(&mut env, obj).unwrap();
    }

    #[test]
    fn small_double_free_is_rejected() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-dfree", 48, 8, None, None);
        let obj = cache.alloc(&mut env).unwrap();
        cache.free(&mut env, obj).unwrap();
        assert_eq!(cache.free(&mut env, obj), Err(KernelError::Inval));
    }

    #[test]
    fn cache_coloring_shifts_successive_slabs() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        // 56-byte objects leave tail slack on both 32- and 64-bit hosts.
        let cache = KmemCache::new("test-color", 56, 8, None, None);
        assert!(cache.color_range > 0, "pick an object size that colors");
        let per_slab = cache.objects_per_slab();

        let first_slab_obj = cache.alloc(&mut env).unwrap();
        for _ in 1..per_slab {
            cache.alloc(&mut env).unwrap();
        }
        let second_slab_obj = cache.alloc(&mut env).unwrap();

        let off_a = first_slab_obj.as_ptr() as usize & (PAGE_SIZE - 1);
        let off_b = second_slab_obj.as_ptr() as usize & (PAGE_SIZE - 1);
        assert_ne!(off_a, off_b, "second slab should start at a new color");
    }

    #[test]
    fn created_caches_live_in_the_cache_cache() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };

        let cache = kmem_cache_create(&mut env, "test-dyn", 96, 8, None, None).unwrap();
        // SAFETY: fresh cache from kmem_cache_create.
        let obj = unsafe { cache.as_ref() }.alloc(&mut env).unwrap();

        // Destroy refuses while objects are outstanding.
        // SAFETY: cache is live; destroy failure leaves it usable.
        assert_eq!(
            unsafe { kmem_cache_destroy(&mut env, cache) },
            Err(KernelError::Busy)
        );

        // SAFETY: cache is live.
        unsafe { cache.as_ref() }.free(&mut env, obj).unwrap();
        // SAFETY: all objects returned; cache not used afterwards.
        unsafe { kmem_cache_destroy(&mut env, cache) }.unwrap();
    }

    #[test]
    fn invariant_inuse_matches_freelist_complement() {
        let (mut backing, mut hash) = env_parts();
        let mut env = SlabEnv {
            backing: &mut backing,
            hash: &mut hash,
        };
        let cache = KmemCache::new("test-inv", 80, 8, None, None);
        let per_slab = cache.objects_per_slab();

        let objs: Vec<_> = (0..per_slab + 3)
            .map(|_| cache.alloc(&mut env).unwrap())
            .collect();
        let stats = cache.stats();
        assert_eq!(stats.allocated, per_slab + 3);
        assert_eq!(stats.total_slabs, 2);
        assert!(consistent(&stats));

        for obj in objs {
            cache.free(&mut env, obj).unwrap();
        }
        assert_eq!(cache.stats().allocated, 0);
    }
}
