//! Declarative routine signatures and their lowering to guest ABI types.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::{FuncType, ValType};

/// A parameter as the host routine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Param {
    /// 32-bit integer, by value
    I32,
    /// 64-bit integer, by value
    I64,
    /// 32-bit float, by value
    F32,
    /// 64-bit float, by value
    F64,
    /// Guest offset of a fixed-size block of `size` bytes
    Ptr {
        /// Bytes the host may read at the offset
        size: u32,
    },
    /// Guest offset of a [`StrDescriptor`](super::StrDescriptor)
    Str,
    /// `count`, guest offset of `count` string offsets, and guest offset of
    /// `count` i32 lengths (0 when every string is NUL-terminated)
    StrArray,
}

impl Param {
    /// Guest ABI slots this parameter occupies.
    pub fn abi_types(&self) -> &'static [ValType] {
        match self {
            Param::I32 | Param::Ptr { .. } | Param::Str => &[ValType::I32],
            Param::I64 => &[ValType::I64],
            Param::F32 => &[ValType::F32],
            Param::F64 => &[ValType::F64],
            Param::StrArray => &[ValType::I32, ValType::I32, ValType::I32],
        }
    }
}

/// A result as the host routine produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ret {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Bytes copied into scratch memory; the guest passes a leading i32
    /// offset where the host writes the descriptor.
    Str,
}

impl Ret {
    /// Scalar ABI result kind, or `None` for results returned through memory.
    pub fn abi_type(&self) -> Option<ValType> {
        match self {
            Ret::I32 => Some(ValType::I32),
            Ret::I64 => Some(ValType::I64),
            Ret::F32 => Some(ValType::F32),
            Ret::F64 => Some(ValType::F64),
            Ret::Str => None,
        }
    }
}

/// Declarative signature of a host routine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature {
    /// Parameters, in order
    pub params: Vec<Param>,
    /// Results, in order (empty for void)
    pub results: Vec<Ret>,
}

impl Signature {
    /// Create a signature.
    pub fn new(params: &[Param], results: &[Ret]) -> Self {
        Self {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    /// Builder: append a parameter.
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Builder: append a result.
    pub fn returns(mut self, ret: Ret) -> Self {
        self.results.push(ret);
        self
    }

    /// Number of leading i32 parameters that carry result descriptor offsets.
    pub fn indirect_results(&self) -> usize {
        self.results.iter().filter(|r| **r == Ret::Str).count()
    }

    /// The guest-visible ABI type.
    ///
    /// Memory-returned results become leading i32 parameters; every
    /// guest-memory reference becomes an i32 offset.
    pub fn lower(&self) -> FuncType {
        let mut params = vec![ValType::I32; self.indirect_results()];
        params.extend(self.params.iter().flat_map(|p| p.abi_types().iter().copied()));
        let results = self.results.iter().filter_map(Ret::abi_type).collect();
        FuncType { params, results }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| format!("{:?}", p)).collect();
        let results: Vec<String> = self.results.iter().map(|r| format!("{:?}", r)).collect();
        write!(f, "({}) -> ({})", params.join(", "), results.join(", "))
    }
}
