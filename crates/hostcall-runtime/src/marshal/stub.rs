//! Generic stub built from a signature and a host routine.

use std::sync::Arc;

use super::args::{decode, Args};
use super::descriptor::StrDescriptor;
use super::signature::{Ret, Signature};
use super::value::Value;
use crate::error::{HostError, Result};
use crate::imports::{Caller, HostFn};

/// A single result produced by a host routine.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Bytes to copy into scratch memory
    Str(Vec<u8>),
}

impl ReturnValue {
    fn matches(&self, ret: Ret) -> bool {
        matches!(
            (self, ret),
            (ReturnValue::I32(_), Ret::I32)
                | (ReturnValue::I64(_), Ret::I64)
                | (ReturnValue::F32(_), Ret::F32)
                | (ReturnValue::F64(_), Ret::F64)
                | (ReturnValue::Str(_), Ret::Str)
        )
    }
}

/// Results of a host routine, in signature order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Returns(pub Vec<ReturnValue>);

impl Returns {
    /// No results.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// A single result.
    pub fn one(value: impl Into<ReturnValue>) -> Self {
        Self(vec![value.into()])
    }

    /// Builder: append a result.
    pub fn and(mut self, value: impl Into<ReturnValue>) -> Self {
        self.0.push(value.into());
        self
    }
}

impl From<i32> for ReturnValue {
    fn from(v: i32) -> Self {
        ReturnValue::I32(v)
    }
}

impl From<i64> for ReturnValue {
    fn from(v: i64) -> Self {
        ReturnValue::I64(v)
    }
}

impl From<f32> for ReturnValue {
    fn from(v: f32) -> Self {
        ReturnValue::F32(v)
    }
}

impl From<f64> for ReturnValue {
    fn from(v: f64) -> Self {
        ReturnValue::F64(v)
    }
}

impl From<Vec<u8>> for ReturnValue {
    fn from(v: Vec<u8>) -> Self {
        ReturnValue::Str(v)
    }
}

impl From<&[u8]> for ReturnValue {
    fn from(v: &[u8]) -> Self {
        ReturnValue::Str(v.to_vec())
    }
}

impl From<String> for ReturnValue {
    fn from(v: String) -> Self {
        ReturnValue::Str(v.into_bytes())
    }
}

impl From<&str> for ReturnValue {
    fn from(v: &str) -> Self {
        ReturnValue::Str(v.as_bytes().to_vec())
    }
}

/// Wrap a declarative host routine in a raw stub.
///
/// The stub decodes arguments per `signature`, runs `routine`, and encodes
/// its results. Arguments borrow guest memory and are dropped before any
/// result is written back.
pub fn marshal<T, F>(signature: Signature, routine: F) -> HostFn<T>
where
    T: 'static,
    F: Fn(&mut T, &Args<'_>) -> Result<Returns> + Send + Sync + 'static,
{
    Arc::new(move |caller: &mut Caller<'_, T>, params: &[Value], results: &mut [Value]| {
        let (slots, returns) = {
            let (memory, _, data, name) = caller.parts();
            let (args, slots) = decode(name, &signature, memory, params).map_err(|e| {
                tracing::warn!(import = name, "call aborted while decoding arguments: {}", e);
                e
            })?;
            (slots, routine(data, &args)?)
        };
        encode(caller, &signature, slots, returns, results)
    })
}

/// Write routine results back into ABI result slots and guest memory.
fn encode<T>(
    caller: &mut Caller<'_, T>,
    signature: &Signature,
    slots: Vec<u32>,
    returns: Returns,
    results: &mut [Value],
) -> Result<()> {
    let (memory, scratch, _, name) = caller.parts();
    let mismatch = |reason: String| HostError::SignatureMismatch {
        name: name.to_string(),
        reason,
    };

    if returns.0.len() != signature.results.len() {
        return Err(mismatch(format!(
            "routine produced {} results, signature declares {}",
            returns.0.len(),
            signature.results.len()
        )));
    }

    let mut slots = slots.into_iter();
    let mut scalar = 0;
    for (i, (value, ret)) in returns.0.into_iter().zip(&signature.results).enumerate() {
        if !value.matches(*ret) {
            return Err(mismatch(format!("result {} is {:?}, expected {:?}", i, value, ret)));
        }

        let abi = match value {
            ReturnValue::I32(v) => Value::I32(v),
            ReturnValue::I64(v) => Value::I64(v),
            ReturnValue::F32(v) => Value::F32(v),
            ReturnValue::F64(v) => Value::F64(v),
            ReturnValue::Str(bytes) => {
                let at = slots
                    .next()
                    .ok_or_else(|| mismatch("missing result descriptor slot".to_string()))?;
                let offset = scratch.push_bytes(memory, &bytes)?;
                StrDescriptor::new(offset, bytes.len() as u64).write(memory, at)?;
                continue;
            }
        };

        let slot = results
            .get_mut(scalar)
            .ok_or_else(|| mismatch(format!("no result slot for result {}", i)))?;
        *slot = abi;
        scalar += 1;
    }
    Ok(())
}
