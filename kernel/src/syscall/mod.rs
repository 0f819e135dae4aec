//! System-call surface.
//!
//! Thin translation layer: decode arguments, call into the fs contract
//! or process credentials, encode results as POSIX-style returns (the
//! natural value on success, the negated errno on failure). Syscall
//! numbers and the trap ABI live in the arch layer and are not part of
//! this contract.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::fs::SeekWhence;
use crate::process::Process;

/// The "leave this id unchanged" marker of setreuid/setresuid.
const ID_UNCHANGED: u32 = u32::MAX;

/// Encode a kernel result as a syscall return value.
pub fn encode(result: KernelResult<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(err) => -(err.errno() as isize),
    }
}

fn id_arg(raw: u32) -> Option<u32> {
    (raw != ID_UNCHANGED).then_some(raw)
}

// ---------------------------------------------------------------------------
// File calls
// ---------------------------------------------------------------------------

/// Open `name` under `dir` and install the file at the lowest free
/// descriptor. Full path walking lives in the VFS layer; the core
/// contract is a single component against a directory vnode.
pub fn sys_open(process: &Arc<Process>, dir: &crate::fs::Vnode, name: &str) -> isize {
    let result = dir
        .lookup(name)
        .and_then(|vnode| vnode.open())
        .and_then(|file| process.files.lock().alloc(file));
    encode(result)
}

pub fn sys_read(process: &Arc<Process>, fd: usize, buf: &mut [u8]) -> isize {
    encode(
        process
            .files
            .lock()
            .get(fd)
            .and_then(|file| file.read(buf)),
    )
}

pub fn sys_write(process: &Arc<Process>, fd: usize, buf: &[u8]) -> isize {
    encode(
        process
            .files
            .lock()
            .get(fd)
            .and_then(|file| file.write(buf)),
    )
}

pub fn sys_close(process: &Arc<Process>, fd: usize) -> isize {
    encode(process.files.lock().close(fd).map(|_| 0))
}

pub fn sys_lseek(process: &Arc<Process>, fd: usize, offset: i64, whence: i32) -> isize {
    let result = SeekWhence::from_raw(whence).and_then(|whence| {
        process
            .files
            .lock()
            .get(fd)
            .and_then(|file| file.seek(whence, offset))
            .map(|position| position as usize)
    });
    encode(result)
}

/// Minimal stat payload the core surfaces (the full struct layout is
/// libc's business).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

pub fn sys_fstat(process: &Arc<Process>, fd: usize, out: &mut Stat) -> isize {
    let result = process.files.lock().get(fd).map(|file| {
        let creds = process.creds.lock();
        *out = Stat {
            size: file.size(),
            uid: creds.uid,
            gid: creds.gid,
        };
        0
    });
    encode(result)
}

// ---------------------------------------------------------------------------
// Credential calls
// ---------------------------------------------------------------------------

pub fn sys_getuid(process: &Arc<Process>) -> isize {
    process.creds.lock().uid as isize
}

pub fn sys_geteuid(process: &Arc<Process>) -> isize {
    process.creds.lock().euid as isize
}

pub fn sys_getgid(process: &Arc<Process>) -> isize {
    process.creds.lock().gid as isize
}

pub fn sys_getegid(process: &Arc<Process>) -> isize {
    process.creds.lock().egid as isize
}

pub fn sys_setuid(process: &Arc<Process>, uid: u32) -> isize {
    encode(process.creds.lock().setuid(uid).map(|_| 0))
}

pub fn sys_seteuid(process: &Arc<Process>, euid: u32) -> isize {
    encode(process.creds.lock().seteuid(euid).map(|_| 0))
}

pub fn sys_setreuid(process: &Arc<Process>, ruid: u32, euid: u32) -> isize {
    encode(
        process
            .creds
            .lock()
            .setreuid(id_arg(ruid), id_arg(euid))
            .map(|_| 0),
    )
}

pub fn sys_setresuid(process: &Arc<Process>, ruid: u32, euid: u32, suid: u32) -> isize {
    encode(
        process
            .creds
            .lock()
            .setresuid(id_arg(ruid), id_arg(euid), id_arg(suid))
            .map(|_| 0),
    )
}

pub fn sys_setgid(process: &Arc<Process>, gid: u32) -> isize {
    encode(process.creds.lock().setgid(gid).map(|_| 0))
}

pub fn sys_setegid(process: &Arc<Process>, egid: u32) -> isize {
    encode(process.creds.lock().setegid(egid).map(|_| 0))
}

pub fn sys_setregid(process: &Arc<Process>, rgid: u32, egid: u32) -> isize {
    encode(
        process
            .creds
            .lock()
            .setregid(id_arg(rgid), id_arg(egid))
            .map(|_| 0),
    )
}

pub fn sys_setresgid(process: &Arc<Process>, rgid: u32, egid: u32, sgid: u32) -> isize {
    encode(
        process
            .creds
            .lock()
            .setresgid(id_arg(rgid), id_arg(egid), id_arg(sgid))
            .map(|_| 0),
    )
}
