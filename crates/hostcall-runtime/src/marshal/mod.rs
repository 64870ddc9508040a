//! Guest-to-host call marshaling.
//!
//! A host routine is described once by a declarative [`Signature`]. The
//! marshaling layer lowers it to the guest ABI type ([`FuncType`]) and
//! wraps the routine in a uniform stub that:
//!
//! 1. decodes every guest argument, translating each guest reference
//! 2. invokes the routine with host-native [`Args`]
//! 3. encodes [`Returns`] back into ABI values, copying byte results into
//!    the scratch arena and writing their descriptors for the guest
//!
//! A translation failure in step 1 aborts the call with
//! [`HostError::MemoryFault`](crate::HostError::MemoryFault) before the
//! routine sees anything.
//!
//! ## Guest ABI
//!
//! | Param | ABI slots | Host view |
//! |-------|-----------|-----------|
//! | `I32`/`I64`/`F32`/`F64` | same | by value |
//! | `Ptr { size }` | i32 offset | `size` bytes |
//! | `Str` | i32 offset of a [`StrDescriptor`] | byte string |
//! | `StrArray` | i32 count, i32 offsets, i32 lengths | `Vec` of byte strings |

mod args;
mod descriptor;
mod signature;
mod stub;
mod value;

pub use args::{Arg, Args};
pub use descriptor::StrDescriptor;
pub use signature::{Param, Ret, Signature};
pub use stub::{marshal, ReturnValue, Returns};
pub use value::{FuncType, ValType, Value};
