//! Processes: PIDs, credentials, open files, address spaces.
//!
//! PID 0 is the kernel process; it runs on the global kernel address
//! space and its threads never exit. Every other process owns an address
//! space and a live-thread refcount: the last exiting thread frees both
//! the space and the record.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::mm::address_space::AddressSpace;
use crate::mm::FrameAllocator;
use crate::sched::Thread;
use crate::sync::{RefCount, SpinLock};

/// PID of the kernel process.
pub const KERNEL_PID: u32 = 0;

/// Open-file-table capacity per process.
pub const MAX_OPEN_FILES: usize = 64;

/// User and group credentials with the saved-id POSIX model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
}

impl Credentials {
    pub const fn root() -> Self {
        Self {
            uid: 0,
            euid: 0,
            suid: 0,
            gid: 0,
            egid: 0,
            sgid: 0,
        }
    }

    pub const fn for_user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            euid: uid,
            suid: uid,
            gid,
            egid: gid,
            sgid: gid,
        }
    }

    fn privileged(&self) -> bool {
        self.euid == 0
    }

    /// setuid(2): privileged callers set all three ids; others may only
    /// switch the effective id to the real or saved one.
    pub fn setuid(&mut self, uid: u32) -> KernelResult<()> {
        if self.privileged() {
            self.uid = uid;
            self.euid = uid;
            self.suid = uid;
            Ok(())
        } else if uid == self.uid || uid == self.suid {
            self.euid = uid;
            Ok(())
        } else {
            Err(KernelError::Perm)
        }
    }

    /// seteuid(2).
    pub fn seteuid(&mut self, euid: u32) -> KernelResult<()> {
        if self.privileged() || euid == self.uid || euid == self.suid {
            self.euid = euid;
            Ok(())
        } else {
            Err(KernelError::Perm)
        }
    }

    /// setreuid(2); `None` leaves an id unchanged. A changed real id (or
    /// an effective id differing from the real) updates the saved id.
    pub fn setreuid(&mut self, ruid: Option<u32>, euid: Option<u32>) -> KernelResult<()> {
        let new_ruid = ruid.unwrap_or(self.uid);
        let new_euid = euid.unwrap_or(self.euid);
        if !self.privileged() {
            let ruid_ok = new_ruid == self.uid || new_ruid == self.euid;
            let euid_ok =
                new_euid == self.uid || new_euid == self.euid || new_euid == self.suid;
            if !ruid_ok || !euid_ok {
                return Err(KernelError::Perm);
            }
        }
        let update_saved = ruid.is_some() || new_euid != new_ruid;
        self.uid = new_ruid;
        self.euid = new_euid;
        if update_saved {
            self.suid = new_euid;
        }
        Ok(())
    }

    /// setresuid(2); `None` leaves an id unchanged.
    pub fn setresuid(
        &mut self,
        ruid: Option<u32>,
        euid: Option<u32>,
        suid: Option<u32>,
    ) -> KernelResult<()> {
        let new = (
            ruid.unwrap_or(self.uid),
            euid.unwrap_or(self.euid),
            suid.unwrap_or(self.suid),
        );
        if !self.privileged() {
            let allowed =
                |id: u32| id == self.uid || id == self.euid || id == self.suid;
            if !allowed(new.0) || !allowed(new.1) || !allowed(new.2) {
                return Err(KernelError::Perm);
            }
        }
        self.uid = new.0;
        self.euid = new.1;
        self.suid = new.2;
        Ok(())
    }

    /// setgid(2), mirroring [`Self::setuid`].
    pub fn setgid(&mut self, gid: u32) -> KernelResult<()> {
        if self.privileged() {
            self.gid = gid;
            self.egid = gid;
            self.sgid = gid;
            Ok(())
        } else if gid == self.gid || gid == self.sgid {
            self.egid = gid;
            Ok(())
        } else {
            Err(KernelError::Perm)
        }
    }

    /// setegid(2).
    pub fn setegid(&mut self, egid: u32) -> KernelResult<()> {
        if self.privileged() || egid == self.gid || egid == self.sgid {
            self.egid = egid;
            Ok(())
        } else {
            Err(KernelError::Perm)
        }
    }

    /// setregid(2).
    pub fn setregid(&mut self, rgid: Option<u32>, egid: Option<u32>) -> KernelResult<()> {
        let new_rgid = rgid.unwrap_or(self.gid);
        let new_egid = egid.unwrap_or(self.egid);
        if !self.privileged() {
            let rgid_ok = new_rgid == self.gid || new_rgid == self.egid;
            let egid_ok =
                new_egid == self.gid || new_egid == self.egid || new_egid == self.sgid;
            if !rgid_ok || !egid_ok {
                return Err(KernelError::Perm);
            }
        }
        let update_saved = rgid.is_some() || new_egid != new_rgid;
        self.gid = new_rgid;
        self.egid = new_egid;
        if update_saved {
            self.sgid = new_egid;
        }
        Ok(())
    }

    /// setresgid(2).
    pub fn setresgid(
        &mut self,
        rgid: Option<u32>,
        egid: Option<u32>,
        sgid: Option<u32>,
    ) -> KernelResult<()> {
        let new = (
            rgid.unwrap_or(self.gid),
            egid.unwrap_or(self.egid),
            sgid.unwrap_or(self.sgid),
        );
        if !self.privileged() {
            let allowed =
                |id: u32| id == self.gid || id == self.egid || id == self.sgid;
            if !allowed(new.0) || !allowed(new.1) || !allowed(new.2) {
                return Err(KernelError::Perm);
            }
        }
        self.gid = new.0;
        self.egid = new.1;
        self.sgid = new.2;
        Ok(())
    }
}

/// Per-process open-file table. Descriptors are allocated lowest-first.
pub struct FileTable {
    entries: Vec<Option<Arc<File>>>,
}

impl FileTable {
    pub fn new() -> Self {
        let mut entries = Vec::new();
        entries.resize_with(MAX_OPEN_FILES, || None);
        Self { entries }
    }

    /// Install `file` at the lowest free descriptor.
    pub fn alloc(&mut self, file: Arc<File>) -> KernelResult<usize> {
        let fd = self
            .entries
            .iter()
            .position(|entry| entry.is_none())
            .ok_or(KernelError::Nomem)?;
        self.entries[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> KernelResult<Arc<File>> {
        self.entries
            .get(fd)
            .and_then(|entry| entry.clone())
            .ok_or(KernelError::BadFd)
    }

    /// Remove a descriptor, returning the file for the caller to drop.
    pub fn close(&mut self, fd: usize) -> KernelResult<Arc<File>> {
        self.entries
            .get_mut(fd)
            .and_then(|entry| entry.take())
            .ok_or(KernelError::BadFd)
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One process.
pub struct Process {
    pub pid: u32,
    pub name: String,
    pub creds: SpinLock<Credentials>,
    pub files: SpinLock<FileTable>,
    pub threads: SpinLock<Vec<Arc<Thread>>>,
    /// `None` for the kernel process, which runs on the global kernel
    /// address space.
    pub space: Option<SpinLock<AddressSpace>>,
    /// Live threads; the last one out triggers teardown.
    live_threads: RefCount,
}

impl Process {
    fn new(pid: u32, name: &str, space: Option<AddressSpace>, creds: Credentials) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: String::from(name),
            creds: SpinLock::new(creds),
            files: SpinLock::new(FileTable::new()),
            threads: SpinLock::new(Vec::new()),
            space: space.map(SpinLock::new),
            live_threads: RefCount::new(0),
        })
    }

    pub fn live_threads(&self) -> usize {
        self.live_threads.get()
    }
}

static PROCESSES: SpinLock<BTreeMap<u32, Arc<Process>>> = SpinLock::new(BTreeMap::new());
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Create the kernel process (PID 0). Called once at boot; a second
/// call is rejected.
pub fn init() -> KernelResult<()> {
    let mut processes = PROCESSES.lock();
    if processes.contains_key(&KERNEL_PID) {
        return Err(KernelError::Busy);
    }
    processes.insert(
        KERNEL_PID,
        Process::new(KERNEL_PID, "kernel", None, Credentials::root()),
    );
    Ok(())
}

pub fn lookup(pid: u32) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&pid).cloned()
}

/// Build a bare process record outside the table: no address space, no
/// PID registration. Used by contract tests and early-boot stand-ins.
pub fn detached(name: &str, creds: Credentials) -> Arc<Process> {
    Process::new(u32::MAX, name, None, creds)
}

/// The kernel process. Panics before [`init`]: tearing down or faulting
/// without it is an invariant violation.
pub fn kernel_process() -> Arc<Process> {
    lookup(KERNEL_PID).expect("kernel process not initialized")
}

/// Create a user process with a fresh address space cloned off the
/// kernel template and credentials inherited from `creds`.
pub fn create(name: &str, creds: Credentials) -> KernelResult<Arc<Process>> {
    let space = {
        let kernel = crate::mm::address_space::kernel_space().lock();
        let mut pmm = crate::mm::PMM.lock();
        AddressSpace::new(&mut pmm, Some(&*kernel))?
    };
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let process = Process::new(pid, name, Some(space), creds);
    PROCESSES.lock().insert(pid, process.clone());
    Ok(process)
}

/// Attach a thread to its owning process.
pub fn attach_thread(process: &Arc<Process>, thread: Arc<Thread>) {
    process.live_threads.inc();
    process.threads.lock().push(thread);
}

/// A thread finished: drop it from its process and, if it was the last
/// one of a user process, free the address space and the record.
pub fn thread_exited(thread: &Thread) {
    let Some(process) = lookup(thread.pid) else {
        return;
    };
    let was_attached = {
        let mut threads = process.threads.lock();
        let before = threads.len();
        threads.retain(|candidate| candidate.tid != thread.tid);
        threads.len() != before
    };
    if !was_attached {
        return;
    }
    if process.pid == KERNEL_PID {
        process.live_threads.dec();
        return;
    }
    if process.live_threads.dec() == 0 {
        PROCESSES.lock().remove(&process.pid);
        if let Some(space) = &process.space {
            // Swap the dying space out so destroy can consume it.
            let mut pmm = crate::mm::PMM.lock();
            let dead = {
                let mut space = space.lock();
                core::mem::replace(&mut *space, AddressSpace::empty())
            };
            if let Err(err) = dead.destroy(&mut pmm) {
                log::warn!("pid {}: address-space teardown failed: {}", process.pid, err);
            }
        }
        log::debug!("pid {} ({}) reaped", process.pid, process.name);
    }
}

/// The process owning the current thread.
pub fn current() -> Option<Arc<Process>> {
    crate::sched::current().and_then(|thread| lookup(thread.pid))
}

/// Run `f` against the current thread's address space (the kernel space
/// when there is no current thread or it belongs to the kernel
/// process). Returns `None` before memory management is up.
pub fn with_current_address_space<R>(
    f: impl FnOnce(&mut AddressSpace, &mut FrameAllocator) -> R,
) -> Option<R> {
    if let Some(process) = current() {
        if let Some(space) = &process.space {
            let mut space = space.lock();
            let mut pmm = crate::mm::PMM.lock();
            return Some(f(&mut space, &mut pmm));
        }
    }
    let space = crate::mm::address_space::try_kernel_space()?;
    let mut space = space.lock();
    let mut pmm = crate::mm::PMM.lock();
    Some(f(&mut space, &mut pmm))
}

/// Kill the current thread (segfault path). The scheduler frees it at
/// the next dispatch attempt.
pub fn kill_current() {
    if let Some(thread) = crate::sched::current() {
        crate::sched::thread_kill(&thread);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_setuid_is_limited_to_real_and_saved() {
        let mut creds = Credentials::for_user(1000, 1000);
        assert_eq!(creds.setuid(0), Err(KernelError::Perm));
        assert_eq!(creds.setuid(1001), Err(KernelError::Perm));
        creds.setuid(1000).unwrap();
        assert_eq!(creds.euid, 1000);
    }

    #[test]
    fn privileged_setuid_drops_all_three_ids() {
        let mut creds = Credentials::root();
        creds.setuid(1000).unwrap();
        assert_eq!(
            (creds.uid, creds.euid, creds.suid),
            (1000, 1000, 1000)
        );
        // Once dropped, privileges cannot be regained.
        assert_eq!(creds.setuid(0), Err(KernelError::Perm));
    }

    #[test]
    fn seteuid_can_bounce_between_real_and_saved() {
        // A setuid binary: real 1000, effective/saved 2000.
        let mut creds = Credentials::for_user(1000, 1000);
        creds.suid = 2000;
        creds.seteuid(2000).unwrap();
        assert_eq!(creds.euid, 2000);
        creds.seteuid(1000).unwrap();
        assert_eq!(creds.euid, 1000);
        assert_eq!(creds.seteuid(3000), Err(KernelError::Perm));
    }

    #[test]
    fn setresuid_honors_the_three_id_rule() {
        let mut creds = Credentials::for_user(1000, 1000);
        creds.setresuid(None, Some(1000), None).unwrap();
        assert_eq!(
            creds.setresuid(Some(0), None, None),
            Err(KernelError::Perm)
        );
        let mut root = Credentials::root();
        root.setresuid(Some(10), Some(20), Some(30)).unwrap();
        assert_eq!((root.uid, root.euid, root.suid), (10, 20, 30));
    }

    #[test]
    fn setgid_family_mirrors_uid_rules() {
        let mut creds = Credentials::for_user(1000, 100);
        assert_eq!(creds.setgid(0), Err(KernelError::Perm));
        creds.setgid(100).unwrap();
        creds.setegid(100).unwrap();
        assert_eq!(creds.setresgid(Some(0), None, None), Err(KernelError::Perm));
    }

    #[test]
    fn file_table_allocates_lowest_descriptor_first() {
        let mut table = FileTable::new();
        let fd0 = table.alloc(crate::fs::memfile::new(b"a")).unwrap();
        let fd1 = table.alloc(crate::fs::memfile::new(b"b")).unwrap();
        assert_eq!((fd0, fd1), (0, 1));

        table.close(fd0).unwrap();
        let reused = table.alloc(crate::fs::memfile::new(b"c")).unwrap();
        assert_eq!(reused, 0);
        assert_eq!(table.open_count(), 2);
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        let mut table = FileTable::new();
        assert_eq!(table.get(0).err(), Some(KernelError::BadFd));
        assert_eq!(table.close(3).err(), Some(KernelError::BadFd));
        assert_eq!(
            table.get(MAX_OPEN_FILES + 1).err(),
            Some(KernelError::BadFd)
        );
    }
}
