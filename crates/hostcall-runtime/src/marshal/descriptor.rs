//! Guest string descriptor layout.
//!
//! ```text
//! offset 0   i64  len
//! offset 8   i32  offset (guest)
//! offset 12  4 bytes padding
//! ```
//!
//! This is the C layout of `struct { int64_t len; int32_t offset; }` on a
//! 32-bit guest: 16 bytes, 8-byte aligned.

use crate::error::{HostError, Result};
use crate::memory::{translate, translate_mut, GuestMemoryRegion, HostView};

/// Guest `(length, offset)` pair naming a byte string in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrDescriptor {
    /// Length in bytes
    pub len: u64,
    /// Guest offset of the first byte
    pub offset: u32,
}

impl StrDescriptor {
    /// Encoded size in guest memory.
    pub const SIZE: u32 = 16;

    /// Required alignment in guest memory.
    pub const ALIGN: u32 = 8;

    /// Create a descriptor.
    pub fn new(offset: u32, len: u64) -> Self {
        Self { len, offset }
    }

    /// Decode a descriptor stored at `at`.
    pub fn read(memory: &GuestMemoryRegion, at: u32) -> Result<Self> {
        let view = translate(memory, at, Self::SIZE)?;
        let bytes = view.as_bytes();
        let mut len = [0u8; 8];
        let mut offset = [0u8; 4];
        len.copy_from_slice(&bytes[0..8]);
        offset.copy_from_slice(&bytes[8..12]);

        let len = i64::from_le_bytes(len);
        if len < 0 {
            return Err(HostError::fault(at as u64, len as u64, memory.current_size()));
        }
        Ok(Self {
            len: len as u64,
            offset: u32::from_le_bytes(offset),
        })
    }

    /// Encode this descriptor at `at`.
    pub fn write(&self, memory: &mut GuestMemoryRegion, at: u32) -> Result<()> {
        let mut view = translate_mut(memory, at, Self::SIZE)?;
        let bytes = view.as_bytes_mut();
        bytes[0..8].copy_from_slice(&(self.len as i64).to_le_bytes());
        bytes[8..12].copy_from_slice(&self.offset.to_le_bytes());
        bytes[12..16].fill(0);
        Ok(())
    }

    /// Translate the bytes this descriptor names.
    pub fn resolve<'a>(&self, memory: &'a GuestMemoryRegion) -> Result<HostView<'a>> {
        translate(memory, self.offset, self.len)
    }
}
