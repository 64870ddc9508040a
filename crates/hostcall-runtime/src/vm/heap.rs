//! Portable heap-backed provider.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{align_up, AddressRange, VirtualMemory, FALLBACK_PAGE_SIZE};
use crate::error::{HostError, Result};

/// Virtual memory provider backed by zeroed heap allocations.
///
/// The whole reservation is allocated up front, so commit only validates
/// the span and decommit zero-fills it. An optional address-space limit
/// caps the total bytes reserved at any one time.
#[derive(Debug)]
pub struct HeapVirtualMemory {
    page_size: usize,
    limit: Option<usize>,
    reserved: AtomicUsize,
}

impl Default for HeapVirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapVirtualMemory {
    /// Create a provider with 4 KiB pages and no limit.
    pub fn new() -> Self {
        Self {
            page_size: FALLBACK_PAGE_SIZE,
            limit: None,
            reserved: AtomicUsize::new(0),
        }
    }

    /// Builder: use a different page size (must be a power of two).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        self.page_size = page_size;
        self
    }

    /// Builder: cap total outstanding reservations at `bytes`.
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Bytes currently reserved through this provider.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    fn layout(&self, len: usize) -> Option<Layout> {
        Layout::from_size_align(len, self.page_size).ok()
    }

    fn page_span(&self, range: &AddressRange, offset: usize, size: usize) -> Result<usize> {
        if offset % self.page_size != 0 {
            return Err(HostError::CommitFailed {
                offset,
                size,
                reason: format!("offset not aligned to {} byte pages", self.page_size),
            });
        }
        let size = align_up(size, self.page_size).ok_or_else(|| HostError::CommitFailed {
            offset,
            size,
            reason: "size overflows".to_string(),
        })?;
        range.check_span(offset, size)?;
        Ok(size)
    }
}

impl VirtualMemory for HeapVirtualMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize) -> Result<AddressRange> {
        let len = match align_up(size, self.page_size) {
            Some(len) if len > 0 => len,
            _ => {
                return Err(HostError::OutOfAddressSpace {
                    requested: size,
                    reason: "size must be non-zero and representable".to_string(),
                })
            }
        };

        let before = self.reserved.fetch_add(len, Ordering::Relaxed);
        if let Some(limit) = self.limit {
            if before.saturating_add(len) > limit {
                self.reserved.fetch_sub(len, Ordering::Relaxed);
                return Err(HostError::OutOfAddressSpace {
                    requested: size,
                    reason: format!("limit of {} bytes reached ({} reserved)", limit, before),
                });
            }
        }

        let layout = self.layout(len).ok_or_else(|| {
            self.reserved.fetch_sub(len, Ordering::Relaxed);
            HostError::OutOfAddressSpace {
                requested: size,
                reason: "invalid layout".to_string(),
            }
        })?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(AddressRange::new(ptr, len)),
            None => {
                self.reserved.fetch_sub(len, Ordering::Relaxed);
                Err(HostError::OutOfAddressSpace {
                    requested: size,
                    reason: "heap allocation failed".to_string(),
                })
            }
        }
    }

    fn commit(&self, range: &AddressRange, offset: usize, size: usize) -> Result<()> {
        self.page_span(range, offset, size).map(|_| ())
    }

    fn decommit(&self, range: &AddressRange, offset: usize, size: usize) {
        match self.page_span(range, offset, size) {
            Ok(size) => unsafe { range.as_ptr().add(offset).write_bytes(0, size) },
            Err(e) => tracing::warn!("decommit ignored: {}", e),
        }
    }

    fn release(&self, range: AddressRange) {
        if let Some(layout) = self.layout(range.len()) {
            unsafe { alloc::dealloc(range.as_ptr(), layout) };
        }
        self.reserved.fetch_sub(range.len(), Ordering::Relaxed);
    }
}
