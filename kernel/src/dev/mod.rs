//! Device contracts.
//!
//! A device is a capability record: a class tag and the matching typed
//! ops table. The core only consumes block devices (filesystem backing)
//! and the console write contract (logging); everything else stays in
//! the driver layer.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Block,
    Char,
    Ethernet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
}

/// One block transfer.
pub struct BlockRequest<'a> {
    pub op: BlockOp,
    /// First block index.
    pub lba: u64,
    /// Number of blocks.
    pub count: usize,
    pub buffer: &'a mut [u8],
}

/// Block-device operations.
#[derive(Debug, PartialEq)]
pub struct BlockOps {
    pub submit: fn(&Device, &mut BlockRequest<'_>) -> KernelResult<()>,
    pub block_size: fn(&Device) -> usize,
}

/// Console write contract consumed by the logger.
#[derive(Debug, PartialEq)]
pub struct ConsoleOps {
    pub write: fn(&Device, &[u8]),
}

/// Typed ops, matching the device class.
#[derive(Debug, PartialEq)]
pub enum DeviceOps {
    Block(&'static BlockOps),
    Console(&'static ConsoleOps),
    Ethernet,
}

/// An opaque device handle.
#[derive(Debug, PartialEq)]
pub struct Device {
    pub name: &'static str,
    pub class: DeviceClass,
    pub ops: DeviceOps,
    /// Driver-private handle.
    pub data: usize,
}

impl Device {
    /// Submit a block request; non-block devices refuse.
    pub fn submit(&self, request: &mut BlockRequest<'_>) -> KernelResult<()> {
        match &self.ops {
            DeviceOps::Block(ops) => (ops.submit)(self, request),
            _ => Err(KernelError::NotSupported),
        }
    }

    pub fn block_size(&self) -> KernelResult<usize> {
        match &self.ops {
            DeviceOps::Block(ops) => Ok((ops.block_size)(self)),
            _ => Err(KernelError::NotSupported),
        }
    }

    pub fn console_write(&self, bytes: &[u8]) -> KernelResult<()> {
        match &self.ops {
            DeviceOps::Console(ops) => {
                (ops.write)(self, bytes);
                Ok(())
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}

static DEVICES: SpinLock<Vec<Arc<Device>>> = SpinLock::new(Vec::new());

/// Register a device with the kernel. Names must be unique.
pub fn register(device: Arc<Device>) -> KernelResult<()> {
    let mut devices = DEVICES.lock();
    if devices.iter().any(|existing| existing.name == device.name) {
        return Err(KernelError::Exist);
    }
    devices.push(device);
    Ok(())
}

/// Look a device up by name.
pub fn find(name: &str) -> KernelResult<Arc<Device>> {
    DEVICES
        .lock()
        .iter()
        .find(|device| device.name == name)
        .cloned()
        .ok_or(KernelError::Nodev)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn echo_submit(_device: &Device, request: &mut BlockRequest<'_>) -> KernelResult<()> {
        // Fill the buffer with the low byte of each block index.
        for (i, chunk) in request.buffer.chunks_mut(512).enumerate() {
            chunk.fill((request.lba as usize + i) as u8);
        }
        Ok(())
    }

    fn block_size_512(_device: &Device) -> usize {
        512
    }

    static ECHO_OPS: BlockOps = BlockOps {
        submit: echo_submit,
        block_size: block_size_512,
    };

    #[test]
    fn block_requests_dispatch_through_the_ops_record() {
        let device = Device {
            name: "test-blk0",
            class: DeviceClass::Block,
            ops: DeviceOps::Block(&ECHO_OPS),
            data: 0,
        };

        let mut buffer = [0u8; 1024];
        let mut request = BlockRequest {
            op: BlockOp::Read,
            lba: 3,
            count: 2,
            buffer: &mut buffer,
        };
        device.submit(&mut request).unwrap();
        assert_eq!(request.buffer[0], 3);
        assert_eq!(request.buffer[512], 4);
        assert_eq!(device.block_size().unwrap(), 512);
    }

    #[test]
    fn class_mismatch_is_not_supported() {
        let device = Device {
            name: "test-eth0",
            class: DeviceClass::Ethernet,
            ops: DeviceOps::Ethernet,
            data: 0,
        };
        let mut buffer = [0u8; 16];
        let mut request = BlockRequest {
            op: BlockOp::Read,
            lba: 0,
            count: 1,
            buffer: &mut buffer,
        };
        assert_eq!(device.submit(&mut request), Err(KernelError::NotSupported));
        assert_eq!(device.console_write(b"x"), Err(KernelError::NotSupported));
    }

    #[test]
    fn registry_rejects_duplicates_and_finds_by_name() {
        let device = Arc::new(Device {
            name: "test-registry-blk",
            class: DeviceClass::Block,
            ops: DeviceOps::Block(&ECHO_OPS),
            data: 0,
        });
        register(device.clone()).unwrap();
        assert_eq!(
            register(device.clone()),
            Err(KernelError::Exist)
        );
        assert!(find("test-registry-blk").is_ok());
        assert_eq!(find("absent"), Err(KernelError::Nodev));
    }
}
