//! Import registry and linked import tables.
//!
//! The registry is the host's capability set: every routine a guest may
//! call is registered here under a name and guest ABI type. Nothing that
//! was not registered is reachable.
//!
//! ## Lifecycle
//!
//! ```rust,ignore
//! let mut registry = ImportRegistry::<MyState>::with_builtins()?;
//! registry.register_routine("log", Signature::new(&[Param::I32, Param::Str], &[]), log)?;
//!
//! // Once per guest module, at load time
//! let table = registry.link(&module_imports)?;
//!
//! // Per call: by slot, no name lookup
//! instance.call_import(slot, &params, &mut results)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::marshal::{self, Args, FuncType, Returns, Signature, ValType, Value};
use crate::memory::{GuestMemoryRegion, ScratchArena};

/// Name of the built-in growth import.
pub const MEMORY_GROW: &str = "memory_grow";

/// Everything a stub may touch during one call.
pub struct Caller<'a, T> {
    memory: &'a mut GuestMemoryRegion,
    scratch: &'a mut ScratchArena,
    data: &'a mut T,
    name: &'a str,
}

impl<'a, T> Caller<'a, T> {
    /// Assemble a caller for one import invocation.
    pub fn new(
        memory: &'a mut GuestMemoryRegion,
        scratch: &'a mut ScratchArena,
        data: &'a mut T,
        name: &'a str,
    ) -> Self {
        Self {
            memory,
            scratch,
            data,
            name,
        }
    }

    /// Name of the import being called.
    pub fn import_name(&self) -> &str {
        self.name
    }

    /// Guest memory.
    pub fn memory(&self) -> &GuestMemoryRegion {
        self.memory
    }

    /// Guest memory, mutably.
    pub fn memory_mut(&mut self) -> &mut GuestMemoryRegion {
        self.memory
    }

    /// Host data.
    pub fn data(&self) -> &T {
        self.data
    }

    /// Host data, mutably.
    pub fn data_mut(&mut self) -> &mut T {
        self.data
    }

    /// Disjoint borrows of every part.
    pub(crate) fn parts(&mut self) -> (&mut GuestMemoryRegion, &mut ScratchArena, &mut T, &str) {
        (self.memory, self.scratch, self.data, self.name)
    }
}

/// A raw import stub operating on guest ABI values.
pub type HostFn<T> =
    Arc<dyn Fn(&mut Caller<'_, T>, &[Value], &mut [Value]) -> Result<()> + Send + Sync>;

/// An import as a guest module declares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportDecl {
    /// Import name
    pub name: String,
    /// Guest ABI type
    #[serde(rename = "type")]
    pub ty: FuncType,
}

impl ImportDecl {
    /// Create a declaration.
    pub fn new(name: impl Into<String>, ty: FuncType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ImportKey {
    name: String,
    ty: FuncType,
}

struct Import<T> {
    signature: Option<Signature>,
    stub: HostFn<T>,
}

/// Registry of host routines available to guests.
pub struct ImportRegistry<T> {
    entries: HashMap<ImportKey, Import<T>>,
}

impl<T> Default for ImportRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ImportRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportRegistry")
            .field("imports", &self.entries.len())
            .finish()
    }
}

impl<T> ImportRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Number of registered imports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `name` with type `ty` is registered.
    pub fn contains(&self, name: &str, ty: &FuncType) -> bool {
        self.entries.contains_key(&ImportKey {
            name: name.to_string(),
            ty: ty.clone(),
        })
    }

    /// Add a raw stub.
    pub fn register(&mut self, name: impl Into<String>, ty: FuncType, stub: HostFn<T>) -> Result<()> {
        self.insert(name.into(), ty, None, stub)
    }

    fn insert(
        &mut self,
        name: String,
        ty: FuncType,
        signature: Option<Signature>,
        stub: HostFn<T>,
    ) -> Result<()> {
        let key = ImportKey { name, ty };
        if self.entries.contains_key(&key) {
            return Err(HostError::DuplicateImport {
                name: key.name,
                ty: key.ty,
            });
        }
        tracing::debug!(import = %key.name, ty = %key.ty, "registered import");
        self.entries.insert(key, Import { signature, stub });
        Ok(())
    }

    /// Look up the stub for `name` with type `ty`.
    pub fn resolve(&self, name: &str, ty: &FuncType) -> Result<HostFn<T>> {
        let key = ImportKey {
            name: name.to_string(),
            ty: ty.clone(),
        };
        self.entries
            .get(&key)
            .map(|import| import.stub.clone())
            .ok_or(HostError::UnknownImport {
                name: key.name,
                ty: key.ty,
            })
    }

    /// Declarative signature of a registered routine, if it has one.
    pub fn signature(&self, name: &str, ty: &FuncType) -> Option<&Signature> {
        self.entries
            .get(&ImportKey {
                name: name.to_string(),
                ty: ty.clone(),
            })
            .and_then(|import| import.signature.as_ref())
    }

    /// Registered `(name, type)` pairs, sorted by name.
    pub fn imports(&self) -> Vec<ImportDecl> {
        let mut decls: Vec<ImportDecl> = self
            .entries
            .keys()
            .map(|key| ImportDecl::new(key.name.clone(), key.ty.clone()))
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.ty.to_string().cmp(&b.ty.to_string())));
        decls
    }

    /// Resolve a guest module's imports into a slot table.
    ///
    /// Slots follow declaration order. The first unknown import fails the
    /// whole link.
    pub fn link(&self, decls: &[ImportDecl]) -> Result<ImportTable<T>> {
        let entries = decls
            .iter()
            .map(|decl| -> Result<LinkedImport<T>> {
                Ok(LinkedImport {
                    name: decl.name.clone(),
                    ty: decl.ty.clone(),
                    stub: self.resolve(&decl.name, &decl.ty)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(imports = entries.len(), "linked guest imports");
        Ok(ImportTable { entries })
    }

    /// Names in `decls` that this registry cannot satisfy.
    pub fn missing(&self, decls: &[ImportDecl]) -> Vec<ImportDecl> {
        decls
            .iter()
            .filter(|decl| !self.contains(&decl.name, &decl.ty))
            .cloned()
            .collect()
    }
}

impl<T: 'static> ImportRegistry<T> {
    /// A registry holding the built-in `memory_grow` import.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(
            MEMORY_GROW,
            FuncType::new(&[ValType::I64], &[ValType::I32]),
            Arc::new(memory_grow::<T>),
        )?;
        Ok(registry)
    }

    /// Add a declarative routine, wrapped in a marshaling stub.
    pub fn register_routine<F>(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        routine: F,
    ) -> Result<()>
    where
        F: Fn(&mut T, &Args<'_>) -> Result<Returns> + Send + Sync + 'static,
    {
        let ty = signature.lower();
        let stub = marshal::marshal(signature.clone(), routine);
        self.insert(name.into(), ty, Some(signature), stub)
    }
}

/// Built-in growth hook: `(requested_bytes: i64) -> (base_offset: i32)`.
///
/// Returns `-1` (all bits set) when the reservation is exhausted.
fn memory_grow<T>(caller: &mut Caller<'_, T>, params: &[Value], results: &mut [Value]) -> Result<()> {
    let requested = match params {
        [value] => value.as_i64(),
        _ => None,
    }
    .ok_or_else(|| HostError::SignatureMismatch {
        name: MEMORY_GROW.to_string(),
        reason: "expected (i64)".to_string(),
    })?;
    let slot = results.first_mut().ok_or_else(|| HostError::SignatureMismatch {
        name: MEMORY_GROW.to_string(),
        reason: "expected one result slot".to_string(),
    })?;

    // Negative requests read as huge unsigned sizes and fail the ceiling check.
    let base = caller.memory_mut().memory_grow(requested as u64);
    *slot = Value::I32(base as i32);
    Ok(())
}

/// An import bound to a slot.
pub struct LinkedImport<T> {
    name: String,
    ty: FuncType,
    stub: HostFn<T>,
}

impl<T> LinkedImport<T> {
    /// Import name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guest ABI type.
    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    /// The stub.
    pub fn stub(&self) -> &HostFn<T> {
        &self.stub
    }
}

/// A guest module's resolved imports, indexed by slot.
pub struct ImportTable<T> {
    entries: Vec<LinkedImport<T>>,
}

impl<T> Default for ImportTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for ImportTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| format!("{} {}", e.name, e.ty)))
            .finish()
    }
}

impl<T> ImportTable<T> {
    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The import in `slot`.
    pub fn get(&self, slot: usize) -> Result<&LinkedImport<T>> {
        self.entries.get(slot).ok_or(HostError::InvalidSlot {
            slot,
            len: self.entries.len(),
        })
    }

    /// Slot of the first import called `name`.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// `(slot, import)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &LinkedImport<T>)> {
        self.entries.iter().enumerate()
    }

    /// Type-check raw values and invoke the stub in `slot`.
    pub fn call(
        &self,
        slot: usize,
        memory: &mut GuestMemoryRegion,
        scratch: &mut ScratchArena,
        data: &mut T,
        params: &[Value],
        results: &mut [Value],
    ) -> Result<()> {
        let import = self.get(slot)?;
        import
            .ty
            .check(params, results)
            .map_err(|reason| HostError::SignatureMismatch {
                name: import.name.clone(),
                reason,
            })?;
        for (value, ty) in results.iter_mut().zip(&import.ty.results) {
            *value = Value::default_for(*ty);
        }

        tracing::trace!(slot, import = %import.name, "guest import call");
        let mut caller = Caller::new(memory, scratch, data, &import.name);
        (import.stub)(&mut caller, params, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{Param, Ret};
    use crate::vm::default_provider;

    fn string_len(_: &mut (), args: &Args<'_>) -> Result<Returns> {
        Ok(Returns::one(args.bytes(0)?.len() as i32))
    }

    fn call_env() -> (GuestMemoryRegion, ScratchArena) {
        let mut memory = GuestMemoryRegion::create(default_provider(), 1 << 20).unwrap();
        memory.grow_pages(1).unwrap();
        let base = memory.memory_grow(4096);
        (memory, ScratchArena::new(base, 4096))
    }

    #[test]
    fn test_duplicate_import() {
        let mut registry = ImportRegistry::<()>::new();
        let sig = Signature::new(&[Param::Str], &[Ret::I32]);
        registry.register_routine("len", sig.clone(), string_len).unwrap();
        let err = registry.register_routine("len", sig, string_len).unwrap_err();
        assert!(matches!(err, HostError::DuplicateImport { .. }));
    }

    #[test]
    fn test_same_name_different_type_is_allowed() {
        let mut registry = ImportRegistry::<()>::new();
        registry
            .register_routine("len", Signature::new(&[Param::Str], &[Ret::I32]), string_len)
            .unwrap();
        registry
            .register_routine("len", Signature::new(&[Param::Str], &[Ret::I64]), |_, args| {
                Ok(Returns::one(args.bytes(0)?.len() as i64))
            })
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_import() {
        let registry = ImportRegistry::<()>::new();
        let err = registry
            .resolve("nope", &FuncType::new(&[], &[]))
            .err()
            .unwrap();
        assert!(matches!(err, HostError::UnknownImport { .. }));
    }

    #[test]
    fn test_resolve_requires_matching_type() {
        let registry = ImportRegistry::<()>::with_builtins().unwrap();
        assert!(registry
            .resolve(MEMORY_GROW, &FuncType::new(&[ValType::I64], &[ValType::I32]))
            .is_ok());
        assert!(registry
            .resolve(MEMORY_GROW, &FuncType::new(&[ValType::I32], &[ValType::I32]))
            .is_err());
    }

    #[test]
    fn test_link_assigns_slots_in_order() {
        let mut registry = ImportRegistry::<()>::with_builtins().unwrap();
        let sig = Signature::new(&[Param::Str], &[Ret::I32]);
        let len_ty = sig.lower();
        registry.register_routine("len", sig, string_len).unwrap();

        let table = registry
            .link(&[
                ImportDecl::new("len", len_ty),
                ImportDecl::new(MEMORY_GROW, FuncType::new(&[ValType::I64], &[ValType::I32])),
            ])
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.slot_of("len"), Some(0));
        assert_eq!(table.slot_of(MEMORY_GROW), Some(1));
        assert!(table.get(2).is_err());
    }

    #[test]
    fn test_link_fails_on_first_unknown() {
        let registry = ImportRegistry::<()>::with_builtins().unwrap();
        let decls = [
            ImportDecl::new(MEMORY_GROW, FuncType::new(&[ValType::I64], &[ValType::I32])),
            ImportDecl::new("draw_rect", FuncType::new(&[ValType::F32; 4], &[])),
        ];
        let err = registry.link(&decls).err().unwrap();
        match err {
            HostError::UnknownImport { name, .. } => assert_eq!(name, "draw_rect"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.missing(&decls).len(), 1);
    }

    #[test]
    fn test_table_call_checks_types() {
        let registry = ImportRegistry::<()>::with_builtins().unwrap();
        let table = registry
            .link(&[ImportDecl::new(MEMORY_GROW, FuncType::new(&[ValType::I64], &[ValType::I32]))])
            .unwrap();
        let (mut memory, mut scratch) = call_env();
        let mut results = [Value::I32(0)];

        let err = table
            .call(0, &mut memory, &mut scratch, &mut (), &[Value::I32(1)], &mut results)
            .unwrap_err();
        assert!(matches!(err, HostError::SignatureMismatch { .. }));

        let before = memory.current_size();
        table
            .call(0, &mut memory, &mut scratch, &mut (), &[Value::I64(1)], &mut results)
            .unwrap();
        assert_eq!(results[0], Value::I32(before as i32));
        assert_eq!(memory.current_size(), before + crate::memory::GUEST_PAGE_SIZE);
    }

    #[test]
    fn test_result_slots_reset_before_call() {
        let mut registry = ImportRegistry::<()>::new();
        let sig = Signature::new(&[], &[Ret::F64]);
        let ty = sig.lower();
        registry
            .register_routine("fails", sig, |_, _| Err(HostError::Capability("denied".to_string())))
            .unwrap();
        let table = registry.link(&[ImportDecl::new("fails", ty)]).unwrap();
        let (mut memory, mut scratch) = call_env();

        let mut results = [Value::I32(5)];
        assert!(table
            .call(0, &mut memory, &mut scratch, &mut (), &[], &mut results)
            .is_err());
        assert_eq!(results[0], Value::F64(0.0));
    }

    #[test]
    fn test_memory_grow_failure_returns_sentinel() {
        let registry = ImportRegistry::<()>::with_builtins().unwrap();
        let table = registry
            .link(&[ImportDecl::new(MEMORY_GROW, FuncType::new(&[ValType::I64], &[ValType::I32]))])
            .unwrap();
        let (mut memory, mut scratch) = call_env();
        let mut results = [Value::I32(0)];

        table
            .call(0, &mut memory, &mut scratch, &mut (), &[Value::I64(-1)], &mut results)
            .unwrap();
        assert_eq!(results[0], Value::I32(-1));
    }

    #[test]
    fn test_imports_listing_is_sorted() {
        let mut registry = ImportRegistry::<()>::with_builtins().unwrap();
        registry
            .register_routine("alpha", Signature::new(&[], &[]), |_, _| Ok(Returns::none()))
            .unwrap();
        let names: Vec<String> = registry.imports().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), MEMORY_GROW.to_string()]);
        assert!(registry
            .signature("alpha", &FuncType::default())
            .is_some());
        assert!(registry
            .signature(MEMORY_GROW, &FuncType::new(&[ValType::I64], &[ValType::I32]))
            .is_none());
    }
}
