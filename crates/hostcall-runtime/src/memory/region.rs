//! Growable guest address space on top of a [`VirtualMemory`] provider.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{HostError, Result};
use crate::vm::{align_up, AddressRange, VirtualMemory};

/// Guest-visible page unit (64 KiB), independent of the host page size.
pub const GUEST_PAGE_SIZE: usize = 64 * 1024;

/// Largest address space a 32-bit guest can name.
pub const MAX_GUEST_MEMORY: u64 = 1 << 32;

/// Value returned by [`GuestMemoryRegion::memory_grow`] when growth fails.
///
/// Base offsets are always guest-page aligned, so this never collides with
/// a real offset.
pub const GROW_FAILED: u32 = u32::MAX;

/// A single growable guest address space.
///
/// Invariants:
/// - `committed <= reserved`
/// - `committed` is a multiple of [`GUEST_PAGE_SIZE`]
/// - the base address is fixed from creation until [`destroy`](Self::destroy)
#[derive(Debug)]
pub struct GuestMemoryRegion {
    provider: Arc<dyn VirtualMemory>,
    range: Option<AddressRange>,
    reserved: usize,
    committed: usize,
    /// High-water mark of provider commits, in host pages.
    host_committed: usize,
}

impl GuestMemoryRegion {
    /// Reserve `reserve_bytes` (rounded up to guest pages) with nothing committed.
    pub fn create(provider: Arc<dyn VirtualMemory>, reserve_bytes: u64) -> Result<Self> {
        if reserve_bytes > MAX_GUEST_MEMORY {
            return Err(HostError::Config(format!(
                "reservation of {} bytes exceeds the {} byte guest address space",
                reserve_bytes, MAX_GUEST_MEMORY
            )));
        }

        let reserved = usize::try_from(reserve_bytes)
            .ok()
            .and_then(|bytes| align_up(bytes, GUEST_PAGE_SIZE))
            .ok_or_else(|| HostError::OutOfAddressSpace {
                requested: usize::MAX,
                reason: format!("{} bytes not representable on this host", reserve_bytes),
            })?;

        let range = provider.reserve(reserved)?;
        tracing::debug!(
            reserved,
            host_page = provider.page_size(),
            "created guest memory region"
        );

        Ok(Self {
            provider,
            range: Some(range),
            reserved,
            committed: 0,
            host_committed: 0,
        })
    }

    /// Reserve and then commit `initial_pages` guest pages.
    pub fn create_with_initial(
        provider: Arc<dyn VirtualMemory>,
        reserve_bytes: u64,
        initial_pages: u32,
    ) -> Result<Self> {
        let mut region = Self::create(provider, reserve_bytes)?;
        region.grow_pages(initial_pages)?;
        Ok(region)
    }

    /// Commit at least `additional` more bytes, rounded up to whole guest pages.
    ///
    /// Returns the new committed size. Growth by zero succeeds and returns
    /// the current size. On [`HostError::OutOfMemory`] nothing changes.
    pub fn grow(&mut self, additional: u64) -> Result<usize> {
        if additional == 0 {
            return Ok(self.committed);
        }

        let out_of_memory = || HostError::OutOfMemory {
            requested: additional,
            committed: self.committed,
            reserved: self.reserved,
        };

        let delta = usize::try_from(additional)
            .ok()
            .and_then(|bytes| align_up(bytes, GUEST_PAGE_SIZE))
            .ok_or_else(out_of_memory)?;
        let new_committed = self
            .committed
            .checked_add(delta)
            .filter(|&end| end <= self.reserved)
            .ok_or_else(out_of_memory)?;
        let range = self.range.as_ref().ok_or_else(out_of_memory)?;

        if new_committed > self.host_committed {
            let host_page = self.provider.page_size();
            let host_end = align_up(new_committed, host_page)
                .unwrap_or(range.len())
                .min(range.len());
            self.provider
                .commit(range, self.host_committed, host_end - self.host_committed)?;
            self.host_committed = host_end;
        }

        tracing::debug!(
            from = self.committed,
            to = new_committed,
            reserved = self.reserved,
            "grew guest memory"
        );
        self.committed = new_committed;
        Ok(new_committed)
    }

    /// Commit `pages` more guest pages.
    pub fn grow_pages(&mut self, pages: u32) -> Result<usize> {
        self.grow(pages as u64 * GUEST_PAGE_SIZE as u64)
    }

    /// Guest-facing growth hook.
    ///
    /// Returns the offset where the newly committed bytes begin, or
    /// [`GROW_FAILED`] when the reservation is exhausted.
    pub fn memory_grow(&mut self, requested_bytes: u64) -> u32 {
        let base = self.committed;
        match self.grow(requested_bytes) {
            Ok(_) => u32::try_from(base).unwrap_or(GROW_FAILED),
            Err(e) => {
                tracing::warn!("guest memory_grow({}) failed: {}", requested_bytes, e);
                GROW_FAILED
            }
        }
    }

    /// Committed bytes visible to the guest.
    pub fn current_size(&self) -> usize {
        self.committed
    }

    /// Reserved ceiling in bytes.
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    /// Committed size in guest pages.
    pub fn page_count(&self) -> u32 {
        (self.committed / GUEST_PAGE_SIZE) as u32
    }

    /// Host address of guest offset 0, or `None` once destroyed.
    pub fn base_ptr(&self) -> Option<NonNull<u8>> {
        self.range
            .as_ref()
            .and_then(|range| NonNull::new(range.as_ptr()))
    }

    /// The provider this region was built on.
    pub fn provider(&self) -> &Arc<dyn VirtualMemory> {
        &self.provider
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.range.is_none()
    }

    /// Release the reservation. A second call is a no-op.
    pub fn destroy(&mut self) {
        if let Some(range) = self.range.take() {
            tracing::debug!(
                reserved = self.reserved,
                committed = self.committed,
                "destroying guest memory region"
            );
            self.provider.release(range);
        }
        self.reserved = 0;
        self.committed = 0;
        self.host_committed = 0;
    }

    /// All committed bytes.
    pub(crate) fn committed_bytes(&self) -> &[u8] {
        match &self.range {
            // Safety: [base, base + committed) is committed and owned by self.
            Some(range) => unsafe { std::slice::from_raw_parts(range.as_ptr(), self.committed) },
            None => &[],
        }
    }

    /// All committed bytes, mutably.
    pub(crate) fn committed_bytes_mut(&mut self) -> &mut [u8] {
        match &self.range {
            // Safety: as above; `&mut self` guarantees exclusivity.
            Some(range) => unsafe {
                std::slice::from_raw_parts_mut(range.as_ptr(), self.committed)
            },
            None => &mut [],
        }
    }
}

impl Drop for GuestMemoryRegion {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{default_provider, HeapVirtualMemory};

    const MIB: u64 = 1024 * 1024;

    fn region(reserve: u64) -> GuestMemoryRegion {
        GuestMemoryRegion::create(default_provider(), reserve).unwrap()
    }

    #[test]
    fn test_create_starts_uncommitted() {
        let r = region(2 * MIB);
        assert_eq!(r.current_size(), 0);
        assert_eq!(r.reserved_size(), 2 * MIB as usize);
        assert!(r.base_ptr().is_some());
    }

    #[test]
    fn test_reserve_rounds_to_guest_pages() {
        let r = region(1);
        assert_eq!(r.reserved_size(), GUEST_PAGE_SIZE);
    }

    #[test]
    fn test_grow_rounds_up_to_page() {
        let mut r = region(2 * MIB);
        assert_eq!(r.grow(1000).unwrap(), 65536);
        assert_eq!(r.current_size(), 65536);
        assert_eq!(r.page_count(), 1);
    }

    #[test]
    fn test_grow_past_reservation_fails_unchanged() {
        let mut r = region(2 * MIB);
        r.grow(1000).unwrap();
        let err = r.grow(2 * MIB).unwrap_err();
        assert!(matches!(err, HostError::OutOfMemory { .. }));
        assert_eq!(r.current_size(), 65536);
    }

    #[test]
    fn test_grow_zero_is_noop() {
        let mut r = region(2 * MIB);
        assert_eq!(r.grow(0).unwrap(), 0);
        r.grow(1).unwrap();
        assert_eq!(r.grow(0).unwrap(), GUEST_PAGE_SIZE);
    }

    #[test]
    fn test_grow_to_exact_ceiling() {
        let mut r = region(2 * MIB);
        assert_eq!(r.grow(2 * MIB).unwrap(), 2 * MIB as usize);
        assert!(r.grow(1).is_err());
    }

    #[test]
    fn test_grow_huge_request_does_not_overflow() {
        let mut r = region(2 * MIB);
        assert!(matches!(
            r.grow(u64::MAX).unwrap_err(),
            HostError::OutOfMemory { .. }
        ));
        assert_eq!(r.current_size(), 0);
    }

    #[test]
    fn test_size_is_monotonic() {
        let mut r = region(4 * MIB);
        let mut last = 0;
        for request in [1u64, 0, 70_000, 3 * MIB, 5, MIB] {
            let _ = r.grow(request);
            assert!(r.current_size() >= last);
            assert!(r.current_size() <= r.reserved_size());
            assert_eq!(r.current_size() % GUEST_PAGE_SIZE, 0);
            last = r.current_size();
        }
    }

    #[test]
    fn test_memory_grow_returns_previous_size() {
        let mut r = region(2 * MIB);
        assert_eq!(r.memory_grow(10), 0);
        assert_eq!(r.memory_grow(GUEST_PAGE_SIZE as u64), GUEST_PAGE_SIZE as u32);
        assert_eq!(r.memory_grow(4 * MIB), GROW_FAILED);
        assert_eq!(r.current_size(), 2 * GUEST_PAGE_SIZE);
    }

    #[test]
    fn test_committed_memory_is_writable_and_zeroed() {
        let mut r = region(MIB);
        r.grow_pages(2).unwrap();
        let bytes = r.committed_bytes_mut();
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[2 * GUEST_PAGE_SIZE - 1] = 0x5A;
        assert_eq!(r.committed_bytes()[2 * GUEST_PAGE_SIZE - 1], 0x5A);
    }

    #[test]
    fn test_host_pages_larger_than_guest_pages() {
        let provider = Arc::new(HeapVirtualMemory::new().with_page_size(256 * 1024));
        let mut r = GuestMemoryRegion::create(provider, MIB).unwrap();
        assert_eq!(r.grow(1).unwrap(), GUEST_PAGE_SIZE);
        assert_eq!(r.grow(1).unwrap(), 2 * GUEST_PAGE_SIZE);
        assert_eq!(r.grow(3 * GUEST_PAGE_SIZE as u64).unwrap(), 5 * GUEST_PAGE_SIZE);
    }

    #[test]
    fn test_create_with_initial_pages() {
        let r = GuestMemoryRegion::create_with_initial(default_provider(), MIB, 3).unwrap();
        assert_eq!(r.current_size(), 3 * GUEST_PAGE_SIZE);
    }

    #[test]
    fn test_create_with_too_many_initial_pages() {
        let err = GuestMemoryRegion::create_with_initial(default_provider(), MIB, 17).unwrap_err();
        assert!(matches!(err, HostError::OutOfMemory { .. }));
    }

    #[test]
    fn test_reservation_failure() {
        let provider = Arc::new(HeapVirtualMemory::new().with_limit(MIB as usize));
        let err = GuestMemoryRegion::create(provider, 2 * MIB).unwrap_err();
        assert!(matches!(err, HostError::OutOfAddressSpace { .. }));
    }

    #[test]
    fn test_reservation_above_guest_address_space() {
        let err = GuestMemoryRegion::create(default_provider(), MAX_GUEST_MEMORY + 1).unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let provider = Arc::new(HeapVirtualMemory::new());
        let mut r = GuestMemoryRegion::create(provider.clone(), MIB).unwrap();
        r.grow(1).unwrap();
        assert_eq!(provider.reserved_bytes(), MIB as usize);

        r.destroy();
        assert!(r.is_destroyed());
        assert_eq!(r.current_size(), 0);
        assert_eq!(r.reserved_size(), 0);
        assert_eq!(provider.reserved_bytes(), 0);

        r.destroy();
        assert_eq!(provider.reserved_bytes(), 0);
        assert!(r.grow(1).is_err());
    }

    #[test]
    fn test_drop_releases_reservation() {
        let provider = Arc::new(HeapVirtualMemory::new());
        {
            let _r = GuestMemoryRegion::create(provider.clone(), MIB).unwrap();
            assert_eq!(provider.reserved_bytes(), MIB as usize);
        }
        assert_eq!(provider.reserved_bytes(), 0);
    }
}
