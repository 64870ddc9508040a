//! Per-frame scratch space inside guest memory.
//!
//! Host routines that produce output (strings, error text) copy it here and
//! hand the guest an offset/length pair. Everything in the arena is valid
//! only until the next [`ScratchArena::reset`]; callers copy out what they
//! need to keep.

use super::region::GuestMemoryRegion;
use super::translate::translate_mut;
use crate::error::{HostError, Result};

/// Bump allocator over a fixed window of guest memory.
#[derive(Debug, Clone)]
pub struct ScratchArena {
    base: u32,
    capacity: u32,
    used: u32,
}

impl ScratchArena {
    /// Arena over `[base, base + capacity)` in guest memory.
    pub fn new(base: u32, capacity: u32) -> Self {
        Self {
            base,
            capacity,
            used: 0,
        }
    }

    /// Guest offset of the arena start.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Arena size in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Whether a guest offset falls inside the arena window.
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.base && (offset - self.base) < self.capacity
    }

    /// Reserve `size` bytes aligned to `align` (a power of two) and return
    /// their guest offset.
    pub fn alloc(&mut self, size: u32, align: u32) -> Result<u32> {
        debug_assert!(align.is_power_of_two());
        let exhausted = || HostError::OutOfMemory {
            requested: size as u64,
            committed: self.used as usize,
            reserved: self.capacity as usize,
        };

        let start = self
            .used
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or_else(exhausted)?;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or_else(exhausted)?;
        let offset = self.base.checked_add(start).ok_or_else(exhausted)?;

        self.used = end;
        Ok(offset)
    }

    /// Copy `data` into the arena and return its guest offset.
    pub fn push_bytes(&mut self, memory: &mut GuestMemoryRegion, data: &[u8]) -> Result<u32> {
        let size = u32::try_from(data.len()).map_err(|_| HostError::OutOfMemory {
            requested: data.len() as u64,
            committed: self.used as usize,
            reserved: self.capacity as usize,
        })?;
        let mark = self.used;
        let offset = self.alloc(size, 1)?;
        if let Err(e) = translate_mut(memory, offset, data.len()).and_then(|mut v| v.copy_from(data)) {
            self.used = mark;
            return Err(e);
        }
        Ok(offset)
    }

    /// Forget everything allocated so far.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GUEST_PAGE_SIZE;
    use crate::vm::default_provider;

    #[test]
    fn test_alloc_alignment_and_exhaustion() {
        let mut arena = ScratchArena::new(0x1000, 64);
        assert_eq!(arena.alloc(3, 1).unwrap(), 0x1000);
        assert_eq!(arena.alloc(8, 8).unwrap(), 0x1008);
        assert_eq!(arena.used(), 16);
        assert!(arena.alloc(49, 1).is_err());
        assert_eq!(arena.used(), 16);
        assert_eq!(arena.alloc(48, 1).unwrap(), 0x1010);
    }

    #[test]
    fn test_window_ending_at_address_space_top() {
        let mut arena = ScratchArena::new(u32::MAX - 65535, 65536);
        assert_eq!(arena.alloc(65536, 1).unwrap(), u32::MAX - 65535);
        let err = arena.alloc(0, 1).unwrap_err();
        assert!(matches!(err, HostError::OutOfMemory { .. }));
        assert_eq!(arena.used(), 65536);
    }

    #[test]
    fn test_reset() {
        let mut arena = ScratchArena::new(0, 16);
        arena.alloc(16, 1).unwrap();
        assert!(arena.alloc(1, 1).is_err());
        arena.reset();
        assert_eq!(arena.alloc(1, 1).unwrap(), 0);
    }

    #[test]
    fn test_contains() {
        let arena = ScratchArena::new(100, 10);
        assert!(!arena.contains(99));
        assert!(arena.contains(100));
        assert!(arena.contains(109));
        assert!(!arena.contains(110));
    }

    #[test]
    fn test_push_bytes_writes_guest_memory() {
        let mut memory = GuestMemoryRegion::create(default_provider(), 1 << 20).unwrap();
        let base = memory.memory_grow(GUEST_PAGE_SIZE as u64);
        let mut arena = ScratchArena::new(base, GUEST_PAGE_SIZE as u32);

        let offset = arena.push_bytes(&mut memory, b"scratch").unwrap();
        assert_eq!(memory.read(offset, 7).unwrap(), b"scratch");
    }

    #[test]
    fn test_push_bytes_outside_committed_memory_rolls_back() {
        let mut memory = GuestMemoryRegion::create(default_provider(), 1 << 20).unwrap();
        let mut arena = ScratchArena::new(0, 1024);
        assert!(arena.push_bytes(&mut memory, b"x").is_err());
        assert_eq!(arena.used(), 0);
    }
}
