//! Virtual memory providers.
//!
//! A provider hands out reserved address ranges and backs parts of them
//! with accessible memory on request. It knows nothing about guests; the
//! [`GuestMemoryRegion`](crate::memory::GuestMemoryRegion) layers guest
//! semantics on top and picks its provider at construction time.
//!
//! | Provider | Platform | Mechanism |
//! |----------|----------|-----------|
//! | [`MmapVirtualMemory`] | unix (`mmap` feature) | `mmap(PROT_NONE)` + `mprotect` |
//! | [`VirtualAllocMemory`] | windows | `VirtualAlloc(MEM_RESERVE)` + `MEM_COMMIT` |
//! | [`HeapVirtualMemory`] | any | zeroed heap block, commit is bookkeeping |

mod heap;
#[cfg(all(unix, feature = "mmap"))]
mod mmap;
#[cfg(windows)]
mod virtual_alloc;

pub use heap::HeapVirtualMemory;
#[cfg(all(unix, feature = "mmap"))]
pub use mmap::MmapVirtualMemory;
#[cfg(windows)]
pub use virtual_alloc::VirtualAllocMemory;

use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{HostError, Result};

/// Fallback page size when the platform cannot be queried.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// A reserved range of host virtual address space.
///
/// Handles are produced by a [`VirtualMemory`] provider and consumed by
/// [`VirtualMemory::release`], so a range cannot be released twice.
#[derive(Debug)]
pub struct AddressRange {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the range is exclusively owned by whoever holds the handle.
unsafe impl Send for AddressRange {}
unsafe impl Sync for AddressRange {}

impl AddressRange {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Start of the range.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is zero-sized (never true for provider-made ranges).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check that `[offset, offset + size)` lies inside this range.
    pub(crate) fn check_span(&self, offset: usize, size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(HostError::CommitFailed {
                offset,
                size,
                reason: format!("span exceeds reserved range of {} bytes", self.len),
            }),
        }
    }
}

/// Platform virtual memory primitives.
///
/// Sizes passed to `commit`/`decommit` are expected to be page-aligned;
/// implementations round up to their own page size.
pub trait VirtualMemory: Send + Sync + Debug {
    /// Native page size of this provider.
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes of address space without backing it.
    fn reserve(&self, size: usize) -> Result<AddressRange>;

    /// Make `[offset, offset + size)` of `range` readable and writable.
    fn commit(&self, range: &AddressRange, offset: usize, size: usize) -> Result<()>;

    /// Return `[offset, offset + size)` of `range` to the reserved state.
    fn decommit(&self, range: &AddressRange, offset: usize, size: usize);

    /// Give the whole range back to the platform.
    fn release(&self, range: AddressRange);
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Page size of the running host.
pub fn host_page_size() -> usize {
    #[cfg(all(unix, feature = "mmap"))]
    {
        mmap::system_page_size()
    }
    #[cfg(windows)]
    {
        virtual_alloc::system_page_size()
    }
    #[cfg(not(any(all(unix, feature = "mmap"), windows)))]
    {
        FALLBACK_PAGE_SIZE
    }
}

/// The provider for the current platform.
pub fn default_provider() -> Arc<dyn VirtualMemory> {
    #[cfg(all(unix, feature = "mmap"))]
    {
        Arc::new(MmapVirtualMemory::new())
    }
    #[cfg(windows)]
    {
        Arc::new(VirtualAllocMemory::new())
    }
    #[cfg(not(any(all(unix, feature = "mmap"), windows)))]
    {
        Arc::new(HeapVirtualMemory::new())
    }
}
