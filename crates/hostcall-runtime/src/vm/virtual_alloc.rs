//! `VirtualAlloc`-backed provider for Windows hosts.

use std::ffi::c_void;
use std::ptr::NonNull;

use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::{align_up, AddressRange, VirtualMemory, FALLBACK_PAGE_SIZE};
use crate::error::{HostError, Result};

/// Query the system page size.
pub(super) fn system_page_size() -> usize {
    let mut info = SYSTEM_INFO::default();
    unsafe { GetSystemInfo(&mut info) };
    match info.dwPageSize as usize {
        0 => FALLBACK_PAGE_SIZE,
        size => size,
    }
}

/// Virtual memory provider using `VirtualAlloc(MEM_RESERVE)`.
///
/// Reserved pages fault on access until committed with `MEM_COMMIT`.
/// Decommitted pages are released with `MEM_DECOMMIT` and read as zero
/// once committed again.
#[derive(Debug, Clone)]
pub struct VirtualAllocMemory {
    page_size: usize,
}

impl Default for VirtualAllocMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualAllocMemory {
    /// Create a provider using the system page size.
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

impl VirtualMemory for VirtualAllocMemory {
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

        let ptr = unsafe { VirtualAlloc(None, len, MEM_RESERVE, PAGE_NOACCESS) };
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| HostError::OutOfAddressSpace {
            requested: size,
            reason: format!("VirtualAlloc failed: {}", std::io::Error::last_os_error()),
        })?;

        tracing::debug!(len, addr = ?ptr, "reserved address range");
        Ok(AddressRange::new(ptr, len))
    }

    fn commit(&self, range: &AddressRange, offset: usize, size: usize) -> Result<()> {
        let size = self.page_span(range, offset, size)?;
        if size == 0 {
            return Ok(());
        }

        let addr = unsafe { range.as_ptr().add(offset) } as *const c_void;
        let ptr = unsafe { VirtualAlloc(Some(addr), size, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(HostError::CommitFailed {
                offset,
                size,
                reason: format!("VirtualAlloc failed: {}", std::io::Error::last_os_error()),
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

        let addr = unsafe { range.as_ptr().add(offset) } as *mut c_void;
        if let Err(e) = unsafe { VirtualFree(addr, size, MEM_DECOMMIT) } {
            tracing::warn!("VirtualFree(MEM_DECOMMIT) failed: {}", e);
        }
    }

    fn release(&self, range: AddressRange) {
        match unsafe { VirtualFree(range.as_ptr() as *mut c_void, 0, MEM_RELEASE) } {
            Ok(()) => tracing::debug!(len = range.len(), "released address range"),
            Err(e) => tracing::warn!("VirtualFree(MEM_RELEASE) failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_page_rounded() {
        let vm = VirtualAllocMemory::new();
        let range = vm.reserve(1).unwrap();
        assert_eq!(range.len(), vm.page_size());
        vm.release(range);
    }

    #[test]
    fn test_zero_reserve_fails() {
        let vm = VirtualAllocMemory::new();
        let err = vm.reserve(0).unwrap_err();
        assert!(matches!(err, HostError::OutOfAddressSpace { .. }));
    }

    #[test]
    fn test_large_reserve_is_lazy() {
        let vm = VirtualAllocMemory::new();
        let range = vm.reserve(1 << 32).unwrap();
        vm.commit(&range, 0, vm.page_size()).unwrap();
        unsafe { range.as_ptr().write(1) };
        vm.release(range);
    }

    #[test]
    fn test_decommit_zeroes_pages() {
        let vm = VirtualAllocMemory::new();
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
