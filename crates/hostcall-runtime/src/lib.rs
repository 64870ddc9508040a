//! # Hostcall Runtime
//!
//! Guest linear memory and bounds-checked host call marshaling for
//! sandboxed modules.
//!
//! A guest sees a single 32-bit address space. The host reserves it up
//! front, commits it in 64 KiB pages as the guest grows, and exposes host
//! routines through an explicit import registry. Every guest offset crosses
//! into host memory through one checked translation step.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`vm`] | Reserve/commit/release address space (mmap or heap) |
//! | [`memory`] | Growable guest region, offset translation, scratch arena |
//! | [`marshal`] | ABI values, declarative signatures, generic call stubs |
//! | [`imports`] | Import registry, link-time slot tables |
//! | [`runtime`] | Per-guest context tying it all together |
//! | [`config`] | Serde-loadable runtime configuration |
//! | [`interface`] | JSON interface descriptions |
//! | [`capabilities`] | Built-in guest logging and sandboxed file access |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hostcall_runtime::{
//!     default_provider, GuestInstance, ImportRegistry, Param, Ret, Returns, RuntimeConfig, Signature,
//! };
//!
//! let mut registry = ImportRegistry::<()>::with_builtins()?;
//! registry.register_routine(
//!     "shout",
//!     Signature::new(&[Param::Str], &[Ret::Str]),
//!     |_, args| Ok(Returns::one(args.str(0)?.to_uppercase())),
//! )?;
//!
//! let table = registry.link(&guest_imports)?;
//! let mut guest = GuestInstance::new(&RuntimeConfig::default(), default_provider(), table, ())?;
//! guest.call_import(slot, &params, &mut results)?;
//! guest.end_frame();
//! ```
//!
//! ## Features
//!
//! - `mmap` - Reserve with `mmap`, commit with `mprotect` (unix)
//! - `capabilities` - Built-in `log` and `file_*` imports
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod imports;
pub mod interface;
pub mod marshal;
pub mod memory;
pub mod runtime;
pub mod vm;

#[cfg(feature = "capabilities")]
pub mod capabilities;

// Re-export main types
pub use config::{CapabilityConfig, MemoryConfig, RuntimeConfig};
pub use error::{HostError, Result};
pub use imports::{Caller, HostFn, ImportDecl, ImportRegistry, ImportTable, MEMORY_GROW};
pub use interface::{load_interface, InterfaceDecl};
pub use marshal::{Args, FuncType, Param, Ret, ReturnValue, Returns, Signature, StrDescriptor, ValType, Value};
pub use memory::{translate, translate_mut, GuestLength, GuestMemoryRegion, ScratchArena, GUEST_PAGE_SIZE};
pub use runtime::GuestInstance;
pub use vm::{default_provider, host_page_size, HeapVirtualMemory, VirtualMemory};

#[cfg(all(unix, feature = "mmap"))]
pub use vm::MmapVirtualMemory;

#[cfg(windows)]
pub use vm::VirtualAllocMemory;

#[cfg(feature = "capabilities")]
pub use capabilities::{register_builtin, FileSandbox};
