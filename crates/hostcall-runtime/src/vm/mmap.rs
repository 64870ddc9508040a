//! `mmap`-backed provider for unix hosts.

use std::ptr::{self, NonNull};

use nix::errno::Errno;
use nix::unistd::{sysconf, SysconfVar};

use super::{align_up, AddressRange, VirtualMemory, FALLBACK_PAGE_SIZE};
use crate::error::{HostError, Result};

/// Query the kernel page size.
pub(super) fn system_page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Virtual memory provider using anonymous `PROT_NONE` mappings.
///
/// Reserved pages fault on access until committed with `mprotect`.
/// Decommitted pages are handed back to the kernel with
/// `madvise(MADV_DONTNEED)` and made inaccessible again.
#[derive(Debug, Clone)]
pub struct MmapVirtualMemory {
    page_size: usize,
}

impl Default for MmapVirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapVirtualMemory {
    /// Create a provider using the kernel page size.
    pub fn new() -> Self {
        Self {
            page_size: system_page_size(),
        }
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

impl VirtualMemory for MmapVirtualMemory {
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

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(HostError::OutOfAddressSpace {
                requested: size,
                reason: format!("mmap failed: {}", Errno::last()),
            });
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| HostError::OutOfAddressSpace {
            requested: size,
            reason: "mmap returned null".to_string(),
        })?;

        tracing::debug!(len, addr = ?ptr, "reserved address range");
        Ok(AddressRange::new(ptr, len))
    }

    fn commit(&self, range: &AddressRange, offset: usize, size: usize) -> Result<()> {
        let size = self.page_span(range, offset, size)?;
        if size == 0 {
            return Ok(());
        }

        let rc = unsafe {
            libc::mprotect(
                range.as_ptr().add(offset) as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(HostError::CommitFailed {
                offset,
                size,
                reason: format!("mprotect failed: {}", Errno::last()),
            });
        }
        Ok(())
    }

    fn decommit(&self, range: &AddressRange, offset: usize, size: usize) {
        let size = match self.page_span(range, offset, size) {
            Ok(0) => return,
            Ok(size) => size,
            Err(e) => {
                tracing::warn!("decommit ignored: {}", e);
                return;
            }
        };

        let addr = unsafe { range.as_ptr().add(offset) } as *mut libc::c_void;
        unsafe {
            if libc::madvise(addr, size, libc::MADV_DONTNEED) != 0 {
                tracing::warn!("madvise failed: {}", Errno::last());
            }
            if libc::mprotect(addr, size, libc::PROT_NONE) != 0 {
                tracing::warn!("mprotect failed: {}", Errno::last());
            }
        }
    }

    fn release(&self, range: AddressRange) {
        let rc = unsafe { libc::munmap(range.as_ptr() as *mut libc::c_void, range.len()) };
        if rc != 0 {
            tracing::warn!("munmap failed: {}", Errno::last());
        } else {
            tracing::debug!(len = range.len(), "released address range");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_page_rounded() {
        let vm = MmapVirtualMemory::new();
        let range = vm.reserve(1).unwrap();
        assert_eq!(range.len(), vm.page_size());
        vm.release(range);
    }

    #[test]
    fn test_zero_reserve_fails() {
        let vm = MmapVirtualMemory::new();
        let err = vm.reserve(0).unwrap_err();
        assert!(matches!(err, HostError::OutOfAddressSpace { .. }));
    }

    #[test]
    fn test_unaligned_commit_fails() {
        let vm = MmapVirtualMemory::new();
        let range = vm.reserve(vm.page_size() * 2).unwrap();
        let err = vm.commit(&range, 1, vm.page_size()).unwrap_err();
        assert!(matches!(err, HostError::CommitFailed { .. }));
        vm.release(range);
    }

    #[test]
    fn test_decommit_zeroes_pages() {
        let vm = MmapVirtualMemory::new();
        let page = vm.page_size();
        let range = vm.reserve(page * 2).unwrap();

        vm.commit(&range, 0, page * 2).unwrap();
        unsafe { range.as_ptr().add(page).write(7) };
        vm.decommit(&range, page, page);
        vm.commit(&range, page, page).unwrap();
        assert_eq!(unsafe { range.as_ptr().add(page).read() }, 0);
        vm.release(range);
    }
}
