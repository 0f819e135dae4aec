//! Virtual-file-system contracts.
//!
//! The kernel core only speaks these vtable shapes; concrete filesystems
//! (the TAR root, devfs) and the path walker live behind them. Dispatch
//! is explicit through the ops records carried by every vnode and file.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// Longest accepted path component.
pub const MAX_NAME_LEN: usize = 255;

/// Reject empty or oversized names before they reach a filesystem.
pub fn validate_name(name: &str) -> KernelResult<()> {
    if name.is_empty() {
        return Err(KernelError::Inval);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(KernelError::NameTooLong);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    File,
    Directory,
    Device,
}

/// Filesystem-node operations, one record per filesystem type.
pub struct VnodeOps {
    pub lookup: fn(&Vnode, &str) -> KernelResult<Arc<Vnode>>,
    pub open: fn(&Vnode) -> KernelResult<Arc<File>>,
    pub create: fn(&Vnode, &str, VnodeKind) -> KernelResult<Arc<Vnode>>,
    pub remove: fn(&Vnode, &str) -> KernelResult<()>,
    pub release: fn(&Vnode),
}

/// A node in some mounted filesystem.
pub struct Vnode {
    pub name: String,
    pub kind: VnodeKind,
    pub ops: &'static VnodeOps,
    /// Filesystem-private handle.
    pub data: usize,
}

impl Vnode {
    pub fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        validate_name(name)?;
        if self.kind != VnodeKind::Directory {
            return Err(KernelError::NotDirectory);
        }
        (self.ops.lookup)(self, name)
    }

    pub fn open(&self) -> KernelResult<Arc<File>> {
        if self.kind == VnodeKind::Directory {
            return Err(KernelError::IsDirectory);
        }
        (self.ops.open)(self)
    }
}

/// Open-file operations, one record per file class.
pub struct FileOps {
    pub read: fn(&File, &mut [u8], u64) -> KernelResult<usize>,
    pub write: fn(&File, &[u8], u64) -> KernelResult<usize>,
    pub size: fn(&File) -> u64,
    pub close: fn(&File),
}

/// Seek origins, matching the POSIX whence values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl SeekWhence {
    pub fn from_raw(raw: i32) -> KernelResult<Self> {
        match raw {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(KernelError::Inval),
        }
    }
}

/// An open file: ops record, position, and the backing vnode.
pub struct File {
    pub vnode: Option<Arc<Vnode>>,
    pub ops: &'static FileOps,
    pub seekable: bool,
    position: SpinLock<u64>,
    /// File-class private handle.
    pub data: usize,
}

impl File {
    pub fn new(vnode: Option<Arc<Vnode>>, ops: &'static FileOps, seekable: bool, data: usize) -> Self {
        Self {
            vnode,
            ops,
            seekable,
            position: SpinLock::new(0),
            data,
        }
    }

    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    /// Read from the current position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut position = self.position.lock();
        let read = (self.ops.read)(self, buf, *position)?;
        *position += read as u64;
        Ok(read)
    }

    /// Write at the current position, advancing it.
    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut position = self.position.lock();
        let written = (self.ops.write)(self, buf, *position)?;
        *position += written as u64;
        Ok(written)
    }

    /// Reposition per `whence`; pipes and sockets refuse with SeekPipe.
    pub fn seek(&self, whence: SeekWhence, offset: i64) -> KernelResult<u64> {
        if !self.seekable {
            return Err(KernelError::SeekPipe);
        }
        let mut position = self.position.lock();
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *position as i64,
            SeekWhence::End => (self.ops.size)(self) as i64,
        };
        let target = base.checked_add(offset).ok_or(KernelError::Inval)?;
        if target < 0 {
            return Err(KernelError::Inval);
        }
        *position = target as u64;
        Ok(*position)
    }

    pub fn size(&self) -> u64 {
        (self.ops.size)(self)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        (self.ops.close)(self);
        if let Some(vnode) = &self.vnode {
            (vnode.ops.release)(vnode);
        }
    }
}

/// An in-memory file, usable anywhere the contract needs a concrete
/// endpoint (early console redirection, tests).
pub mod memfile {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    struct MemFileData {
        bytes: SpinLock<Vec<u8>>,
    }

    fn data(file: &File) -> &MemFileData {
        // SAFETY: memfile::new stores a leaked MemFileData in `data` and
        // nothing else constructs files with MEM_FILE_OPS.
        unsafe { &*(file.data as *const MemFileData) }
    }

    fn read(file: &File, buf: &mut [u8], position: u64) -> KernelResult<usize> {
        let bytes = data(file).bytes.lock();
        let position = position as usize;
        if position >= bytes.len() {
            return Ok(0);
        }
        let count = buf.len().min(bytes.len() - position);
        buf[..count].copy_from_slice(&bytes[position..position + count]);
        Ok(count)
    }

    fn write(file: &File, buf: &[u8], position: u64) -> KernelResult<usize> {
        let mut bytes = data(file).bytes.lock();
        let end = position as usize + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[position as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(file: &File) -> u64 {
        data(file).bytes.lock().len() as u64
    }

    fn close(_file: &File) {}

    static MEM_FILE_OPS: FileOps = FileOps {
        read,
        write,
        size,
        close,
    };

    /// A seekable in-memory file seeded with `initial`.
    pub fn new(initial: &[u8]) -> Arc<File> {
        let data = Box::leak(Box::new(MemFileData {
            bytes: SpinLock::new(initial.to_vec()),
        }));
        Arc::new(File::new(
            None,
            &MEM_FILE_OPS,
            true,
            data as *const MemFileData as usize,
        ))
    }

    /// A non-seekable variant standing in for pipe-like endpoints.
    pub fn new_stream() -> Arc<File> {
        let data = Box::leak(Box::new(MemFileData {
            bytes: SpinLock::new(Vec::new()),
        }));
        Arc::new(File::new(
            None,
            &MEM_FILE_OPS,
            false,
            data as *const MemFileData as usize,
        ))
    }
}
