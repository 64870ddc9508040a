//! Per-guest runtime context.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{HostError, Result};
use crate::imports::ImportTable;
use crate::marshal::Value;
use crate::memory::{GuestMemoryRegion, ScratchArena};
use crate::vm::VirtualMemory;

/// One loaded guest: its memory, scratch space, linked imports and host
/// state.
///
/// Everything a host routine can reach flows through here; there is no
/// process-wide state.
pub struct GuestInstance<T> {
    memory: GuestMemoryRegion,
    scratch: ScratchArena,
    imports: ImportTable<T>,
    data: T,
}

impl<T> std::fmt::Debug for GuestInstance<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("memory", &self.memory)
            .field("scratch", &self.scratch)
            .field("imports", &self.imports)
            .finish_non_exhaustive()
    }
}

impl<T> GuestInstance<T> {
    /// Create guest memory per `config` and carve the scratch arena out of
    /// freshly committed pages above the initial ones.
    pub fn new(
        config: &RuntimeConfig,
        provider: Arc<dyn VirtualMemory>,
        imports: ImportTable<T>,
        data: T,
    ) -> Result<Self> {
        config.validate()?;

        let mut memory = GuestMemoryRegion::create_with_initial(
            provider,
            config.memory.reserve_bytes,
            config.memory.initial_pages,
        )?;
        let base = u32::try_from(memory.current_size()).map_err(|_| {
            HostError::Config("initial memory leaves no room for scratch".to_string())
        })?;
        memory.grow(config.scratch_bytes as u64)?;
        let scratch = ScratchArena::new(base, config.scratch_bytes);

        tracing::debug!(
            committed = memory.current_size(),
            scratch_base = base,
            scratch_bytes = config.scratch_bytes,
            imports = imports.len(),
            "guest instance ready"
        );

        Ok(Self {
            memory,
            scratch,
            imports,
            data,
        })
    }

    /// Invoke the import linked into `slot`.
    ///
    /// Errors are returned, never raised; the guest-facing side decides
    /// whether to trap or report.
    pub fn call_import(&mut self, slot: usize, params: &[Value], results: &mut [Value]) -> Result<()> {
        let result = self.imports.call(
            slot,
            &mut self.memory,
            &mut self.scratch,
            &mut self.data,
            params,
            results,
        );
        if let Err(e) = &result {
            tracing::debug!(slot, recoverable = e.is_guest_recoverable(), "import call failed: {}", e);
        }
        result
    }

    /// Frame boundary: everything in scratch becomes invalid.
    pub fn end_frame(&mut self) {
        self.scratch.reset();
    }

    /// Guest memory.
    pub fn memory(&self) -> &GuestMemoryRegion {
        &self.memory
    }

    /// Guest memory, mutably.
    pub fn memory_mut(&mut self) -> &mut GuestMemoryRegion {
        &mut self.memory
    }

    /// Scratch arena.
    pub fn scratch(&self) -> &ScratchArena {
        &self.scratch
    }

    /// Linked imports.
    pub fn imports(&self) -> &ImportTable<T> {
        &self.imports
    }

    /// Host data.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Host data, mutably.
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Consume the instance and return its host data. Guest memory is released.
    pub fn into_data(self) -> T {
        self.data
    }
}
