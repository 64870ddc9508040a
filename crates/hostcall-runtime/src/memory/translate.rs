//! Guest offset translation.
//!
//! Turns a `(guest offset, length)` pair into a borrowed host view of the
//! committed bytes, or a [`HostError::MemoryFault`]. Views borrow the
//! region, so they cannot outlive a later `grow`.

use super::region::GuestMemoryRegion;
use crate::error::{HostError, Result};

/// Length of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLength {
    /// Exactly this many bytes.
    Exact(u64),
    /// Unknown; the data ends at a NUL terminator. Only the start offset is
    /// validated and the view runs to the end of committed memory.
    Terminated,
}

impl From<u64> for GuestLength {
    fn from(len: u64) -> Self {
        GuestLength::Exact(len)
    }
}

impl From<u32> for GuestLength {
    fn from(len: u32) -> Self {
        GuestLength::Exact(len as u64)
    }
}

impl From<usize> for GuestLength {
    fn from(len: usize) -> Self {
        GuestLength::Exact(len as u64)
    }
}

/// Validated read-only view into guest memory.
#[derive(Debug, Clone, Copy)]
pub struct HostView<'a> {
    offset: u32,
    bytes: &'a [u8],
}

impl<'a> HostView<'a> {
    /// Guest offset the view starts at.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Number of bytes in the view.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Host pointer to the first byte (`base + offset`).
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// The viewed bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Bytes up to (not including) the first NUL.
    ///
    /// Faults if no terminator occurs before the end of the view.
    pub fn until_nul(&self) -> Result<&'a [u8]> {
        match self.bytes.iter().position(|&b| b == 0) {
            Some(end) => Ok(&self.bytes[..end]),
            None => Err(HostError::fault(
                self.offset as u64,
                u64::MAX,
                self.offset as usize + self.bytes.len(),
            )),
        }
    }
}

/// Validated mutable view into guest memory.
#[derive(Debug)]
pub struct HostViewMut<'a> {
    offset: u32,
    bytes: &'a mut [u8],
}

impl<'a> HostViewMut<'a> {
    /// Guest offset the view starts at.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Number of bytes in the view.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The viewed bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    /// Copy `data` into the start of the view.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.bytes.len() {
            return Err(HostError::fault(
                self.offset as u64,
                data.len() as u64,
                self.offset as usize + self.bytes.len(),
            ));
        }
        self.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Resolve `(offset, length)` to a byte span inside committed memory.
fn span(region: &GuestMemoryRegion, offset: u32, length: GuestLength) -> Result<(usize, usize)> {
    let committed = region.current_size();
    let start = offset as u64;
    match length {
        GuestLength::Exact(len) => match start.checked_add(len) {
            Some(end) if end <= committed as u64 => Ok((start as usize, end as usize)),
            _ => Err(HostError::fault(start, len, committed)),
        },
        GuestLength::Terminated if start < committed as u64 => Ok((start as usize, committed)),
        GuestLength::Terminated => Err(HostError::fault(start, u64::MAX, committed)),
    }
}

/// Translate a guest `(offset, length)` pair into a read-only host view.
///
/// Succeeds only if `offset <= offset + length <= current_size`. Overflow
/// of `offset + length` is a fault, never a wrap.
pub fn translate(
    region: &GuestMemoryRegion,
    offset: u32,
    length: impl Into<GuestLength>,
) -> Result<HostView<'_>> {
    let (start, end) = span(region, offset, length.into())?;
    Ok(HostView {
        offset,
        bytes: &region.committed_bytes()[start..end],
    })
}

/// Translate a guest `(offset, length)` pair into a mutable host view.
pub fn translate_mut(
    region: &mut GuestMemoryRegion,
    offset: u32,
    length: impl Into<GuestLength>,
) -> Result<HostViewMut<'_>> {
    let (start, end) = span(region, offset, length.into())?;
    Ok(HostViewMut {
        offset,
        bytes: &mut region.committed_bytes_mut()[start..end],
    })
}

/// Plain scalars that can be copied in and out of guest memory
/// (little-endian, unaligned).
pub trait GuestScalar: Copy + Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from exactly [`Self::SIZE`] bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Encode into exactly [`Self::SIZE`] bytes.
    fn write_le_slice(self, out: &mut [u8]);
}

macro_rules! impl_guest_scalar {
    ($($ty:ty),*) => {
        $(
            impl GuestScalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le_slice(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_guest_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl GuestMemoryRegion {
    /// Copy `len` bytes out of guest memory.
    pub fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        Ok(translate(self, offset, len)?.as_bytes().to_vec())
    }

    /// Copy `data` into guest memory at `offset`.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        translate_mut(self, offset, data.len())?.copy_from(data)
    }

    /// Read a little-endian scalar at `offset`.
    pub fn read_value<T: GuestScalar>(&self, offset: u32) -> Result<T> {
        let view = translate(self, offset, T::SIZE)?;
        Ok(T::from_le_slice(view.as_bytes()))
    }

    /// Write a little-endian scalar at `offset`.
    pub fn write_value<T: GuestScalar>(&mut self, offset: u32, value: T) -> Result<()> {
        let mut view = translate_mut(self, offset, T::SIZE)?;
        value.write_le_slice(view.as_bytes_mut());
        Ok(())
    }

    /// Read `count` consecutive scalars starting at `offset`.
    pub fn read_array<T: GuestScalar>(&self, offset: u32, count: usize) -> Result<Vec<T>> {
        let len = (count as u64).saturating_mul(T::SIZE as u64);
        let view = translate(self, offset, len)?;
        Ok(view
            .as_bytes()
            .chunks_exact(T::SIZE)
            .map(T::from_le_slice)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::default_provider;

    fn region_with_one_page() -> GuestMemoryRegion {
        let mut region = GuestMemoryRegion::create(default_provider(), 2 * 1024 * 1024).unwrap();
        region.grow(1000).unwrap();
        region
    }

    #[test]
    fn test_translate_full_page() {
        let region = region_with_one_page();
        let view = translate(&region, 0, 65536u64).unwrap();
        assert_eq!(view.len(), 65536);
        assert_eq!(view.as_ptr(), region.base_ptr().unwrap().as_ptr() as *const u8);
    }

    #[test]
    fn test_translate_pointer_is_base_plus_offset() {
        let region = region_with_one_page();
        let base = region.base_ptr().unwrap().as_ptr() as usize;
        for offset in [0u32, 1, 4096, 65535] {
            let view = translate(&region, offset, 1u64).unwrap();
            assert_eq!(view.as_ptr() as usize, base + offset as usize);
            assert_eq!(view.offset(), offset);
        }
    }

    #[test]
    fn test_translate_past_committed_faults() {
        let region = region_with_one_page();
        let err = translate(&region, 65530, 10u64).unwrap_err();
        match err {
            HostError::MemoryFault {
                offset,
                length,
                committed,
            } => {
                assert_eq!(offset, 65530);
                assert_eq!(length, 10);
                assert_eq!(committed, 65536);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_translate_overflow_faults() {
        let region = region_with_one_page();
        assert!(translate(&region, u32::MAX, u64::MAX).is_err());
        assert!(translate(&region, 1, u64::MAX).is_err());
    }

    #[test]
    fn test_translate_empty_at_end_is_valid() {
        let region = region_with_one_page();
        let view = translate(&region, 65536, 0u64).unwrap();
        assert!(view.is_empty());
        assert!(translate(&region, 65537, 0u64).is_err());
    }

    #[test]
    fn test_translate_uncommitted_region_faults() {
        let region = GuestMemoryRegion::create(default_provider(), 1 << 20).unwrap();
        assert!(translate(&region, 0, 1u64).is_err());
        assert!(translate(&region, 0, GuestLength::Terminated).is_err());
    }

    #[test]
    fn test_terminated_string() {
        let mut region = region_with_one_page();
        region.write(100, b"hello\0world").unwrap();

        let view = translate(&region, 100, GuestLength::Terminated).unwrap();
        assert_eq!(view.len(), 65536 - 100);
        assert_eq!(view.until_nul().unwrap(), b"hello");
    }

    #[test]
    fn test_unterminated_string_stops_at_committed_end() {
        let mut region = region_with_one_page();
        region.write(65532, b"abcd").unwrap();

        let view = translate(&region, 65532, GuestLength::Terminated).unwrap();
        assert!(matches!(
            view.until_nul().unwrap_err(),
            HostError::MemoryFault { .. }
        ));
        assert!(translate(&region, 65536, GuestLength::Terminated).is_err());
    }

    #[test]
    fn test_scalar_round_trip() {
        let mut region = region_with_one_page();
        region.write_value(8, 0xDEADBEEFu32).unwrap();
        region.write_value(16, -2.5f64).unwrap();
        assert_eq!(region.read_value::<u32>(8).unwrap(), 0xDEADBEEF);
        assert_eq!(region.read_value::<f64>(16).unwrap(), -2.5);
        assert_eq!(region.read(8, 4).unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
        assert!(region.write_value(65533, 1u32).is_err());
    }

    #[test]
    fn test_read_array() {
        let mut region = region_with_one_page();
        for (i, v) in [10i32, -20, 30].iter().enumerate() {
            region.write_value(64 + 4 * i as u32, *v).unwrap();
        }
        assert_eq!(region.read_array::<i32>(64, 3).unwrap(), vec![10, -20, 30]);
        assert!(region.read_array::<i32>(65532, 2).is_err());
        assert!(region.read_array::<u64>(0, usize::MAX).is_err());
    }

    #[test]
    fn test_fault_has_no_side_effect() {
        let mut region = region_with_one_page();
        region.write(65530, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert!(region.write(65530, &[9; 10]).is_err());
        assert_eq!(region.read(65530, 6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }
}
