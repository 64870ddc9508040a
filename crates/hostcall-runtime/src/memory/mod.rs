//! Guest linear memory.
//!
//! A guest sees one flat address space starting at offset 0. The host
//! reserves the whole ceiling up front and commits it in guest pages as
//! the guest asks for more, so the base address never moves.
//!
//! ## Access Discipline
//!
//! Guest offsets are never turned into pointers directly. Every access goes
//! through [`translate`] / [`translate_mut`], which bounds-check against the
//! committed size and hand back a view borrowed from the region:
//!
//! ```rust,ignore
//! let view = translate(&region, offset, 16)?;
//! let header = view.as_bytes();
//! ```

mod region;
mod scratch;
mod translate;

pub use region::{GuestMemoryRegion, GROW_FAILED, GUEST_PAGE_SIZE, MAX_GUEST_MEMORY};
pub use scratch::ScratchArena;
pub use translate::{translate, translate_mut, GuestLength, GuestScalar, HostView, HostViewMut};
