//! Decoding guest ABI values into host arguments.

use super::descriptor::StrDescriptor;
use super::signature::{Param, Signature};
use super::value::Value;
use crate::error::{HostError, Result};
use crate::memory::{translate, GuestLength, GuestMemoryRegion, HostView};

/// A decoded argument. References borrow guest memory for the duration of
/// one call.
#[derive(Debug, Clone)]
pub enum Arg<'a> {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Fixed-size block of guest memory
    Ptr(HostView<'a>),
    /// Byte string named by a descriptor
    Str(&'a [u8]),
    /// Array of byte strings
    StrArray(Vec<&'a [u8]>),
}

/// Decoded arguments handed to a host routine.
#[derive(Debug, Clone, Default)]
pub struct Args<'a> {
    values: Vec<Arg<'a>>,
}

impl<'a> Args<'a> {
    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument at `index`.
    pub fn get(&self, index: usize) -> Option<&Arg<'a>> {
        self.values.get(index)
    }

    /// All arguments.
    pub fn iter(&self) -> impl Iterator<Item = &Arg<'a>> {
        self.values.iter()
    }

    fn arg(&self, index: usize) -> Result<&Arg<'a>> {
        self.values.get(index).ok_or_else(|| HostError::InvalidArgument {
            index,
            reason: format!("only {} arguments", self.values.len()),
        })
    }

    fn mismatch(index: usize, wanted: &str, got: &Arg<'_>) -> HostError {
        HostError::InvalidArgument {
            index,
            reason: format!("expected {}, got {:?}", wanted, got),
        }
    }

    /// Argument `index` as an i32.
    pub fn i32(&self, index: usize) -> Result<i32> {
        match self.arg(index)? {
            Arg::I32(v) => Ok(*v),
            other => Err(Self::mismatch(index, "i32", other)),
        }
    }

    /// Argument `index` as an i64.
    pub fn i64(&self, index: usize) -> Result<i64> {
        match self.arg(index)? {
            Arg::I64(v) => Ok(*v),
            other => Err(Self::mismatch(index, "i64", other)),
        }
    }

    /// Argument `index` as an f32.
    pub fn f32(&self, index: usize) -> Result<f32> {
        match self.arg(index)? {
            Arg::F32(v) => Ok(*v),
            other => Err(Self::mismatch(index, "f32", other)),
        }
    }

    /// Argument `index` as an f64.
    pub fn f64(&self, index: usize) -> Result<f64> {
        match self.arg(index)? {
            Arg::F64(v) => Ok(*v),
            other => Err(Self::mismatch(index, "f64", other)),
        }
    }

    /// Argument `index` as raw bytes (a `Ptr` block or a `Str`).
    pub fn bytes(&self, index: usize) -> Result<&'a [u8]> {
        match self.arg(index)? {
            Arg::Ptr(view) => Ok(view.as_bytes()),
            Arg::Str(bytes) => Ok(bytes),
            other => Err(Self::mismatch(index, "bytes", other)),
        }
    }

    /// Argument `index` as UTF-8 text.
    pub fn str(&self, index: usize) -> Result<&'a str> {
        let bytes = self.bytes(index)?;
        std::str::from_utf8(bytes).map_err(|e| HostError::InvalidArgument {
            index,
            reason: format!("not valid UTF-8: {}", e),
        })
    }

    /// Argument `index` as an array of byte strings.
    pub fn str_array(&self, index: usize) -> Result<&[&'a [u8]]> {
        match self.arg(index)? {
            Arg::StrArray(items) => Ok(items),
            other => Err(Self::mismatch(index, "string array", other)),
        }
    }
}

/// Cursor over raw ABI values.
struct RawCursor<'v> {
    name: &'v str,
    values: &'v [Value],
    pos: usize,
}

impl<'v> RawCursor<'v> {
    fn next(&mut self) -> Result<Value> {
        let value = self
            .values
            .get(self.pos)
            .copied()
            .ok_or_else(|| HostError::SignatureMismatch {
                name: self.name.to_string(),
                reason: format!("missing param {}", self.pos),
            })?;
        self.pos += 1;
        Ok(value)
    }

    fn i32(&mut self) -> Result<i32> {
        let value = self.next()?;
        value.as_i32().ok_or_else(|| self.wrong("i32", value))
    }

    fn i64(&mut self) -> Result<i64> {
        let value = self.next()?;
        value.as_i64().ok_or_else(|| self.wrong("i64", value))
    }

    fn f32(&mut self) -> Result<f32> {
        let value = self.next()?;
        value.as_f32().ok_or_else(|| self.wrong("f32", value))
    }

    fn f64(&mut self) -> Result<f64> {
        let value = self.next()?;
        value.as_f64().ok_or_else(|| self.wrong("f64", value))
    }

    /// An i32 reinterpreted as an unsigned guest offset.
    fn offset(&mut self) -> Result<u32> {
        self.i32().map(|v| v as u32)
    }

    fn wrong(&self, wanted: &str, got: Value) -> HostError {
        HostError::SignatureMismatch {
            name: self.name.to_string(),
            reason: format!("param {} is {}, expected {}", self.pos - 1, got.ty(), wanted),
        }
    }
}

/// Validated result-descriptor slots, decoded before the routine runs.
pub(crate) type ResultSlots = Vec<u32>;

/// Decode raw values for `signature` against guest memory.
///
/// Every guest reference is translated here, before any host code runs, so
/// a bad offset surfaces as [`HostError::MemoryFault`] and the routine is
/// never invoked.
pub(crate) fn decode<'a>(
    name: &str,
    signature: &Signature,
    memory: &'a GuestMemoryRegion,
    raw: &[Value],
) -> Result<(Args<'a>, ResultSlots)> {
    let mut cursor = RawCursor {
        name,
        values: raw,
        pos: 0,
    };

    let mut slots = Vec::with_capacity(signature.indirect_results());
    for i in 0..signature.indirect_results() {
        let at = cursor.offset()?;
        translate(memory, at, StrDescriptor::SIZE)?;
        if at % StrDescriptor::ALIGN != 0 {
            return Err(HostError::SignatureMismatch {
                name: name.to_string(),
                reason: format!(
                    "result slot {} at 0x{:x} is not {}-byte aligned",
                    i,
                    at,
                    StrDescriptor::ALIGN
                ),
            });
        }
        slots.push(at);
    }

    let mut values = Vec::with_capacity(signature.params.len());
    for (index, param) in signature.params.iter().enumerate() {
        let arg = match param {
            Param::I32 => Arg::I32(cursor.i32()?),
            Param::I64 => Arg::I64(cursor.i64()?),
            Param::F32 => Arg::F32(cursor.f32()?),
            Param::F64 => Arg::F64(cursor.f64()?),
            Param::Ptr { size } => Arg::Ptr(translate(memory, cursor.offset()?, *size)?),
            Param::Str => {
                let desc = StrDescriptor::read(memory, cursor.offset()?)?;
                Arg::Str(desc.resolve(memory)?.as_bytes())
            }
            Param::StrArray => {
                let count = cursor.i32()?;
                let strings_at = cursor.offset()?;
                let lengths_at = cursor.offset()?;
                Arg::StrArray(decode_str_array(memory, index, count, strings_at, lengths_at)?)
            }
        };
        values.push(arg);
    }

    if cursor.pos != raw.len() {
        return Err(HostError::SignatureMismatch {
            name: name.to_string(),
            reason: format!("expected {} params, got {}", cursor.pos, raw.len()),
        });
    }

    Ok((Args { values }, slots))
}

/// Decode `count` strings from an offset array and an optional length array.
///
/// A null `lengths_at` or a negative entry means the string is
/// NUL-terminated. The host array is built only after both guest arrays
/// have been validated and is dropped on any fault.
fn decode_str_array<'a>(
    memory: &'a GuestMemoryRegion,
    index: usize,
    count: i32,
    strings_at: u32,
    lengths_at: u32,
) -> Result<Vec<&'a [u8]>> {
    let count = usize::try_from(count).map_err(|_| HostError::InvalidArgument {
        index,
        reason: format!("negative string count {}", count),
    })?;

    let offsets = memory.read_array::<u32>(strings_at, count)?;
    let lengths = match lengths_at {
        0 => None,
        at => Some(memory.read_array::<i32>(at, count)?),
    };

    let mut strings = Vec::with_capacity(count);
    for (i, &offset) in offsets.iter().enumerate() {
        let length = match lengths.as_ref().map(|l| l[i]) {
            Some(len) if len >= 0 => GuestLength::Exact(len as u64),
            _ => GuestLength::Terminated,
        };
        let view = translate(memory, offset, length)?;
        let bytes = match length {
            GuestLength::Terminated => view.until_nul()?,
            GuestLength::Exact(_) => view.as_bytes(),
        };
        strings.push(bytes);
    }
    Ok(strings)
}
