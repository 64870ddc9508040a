//! JSON interface descriptions.
//!
//! An interface file lists the routines a host API exposes, in the same
//! format the guest-side binding generator reads:
//!
//! ```json
//! [
//!   {
//!     "name": "file_read",
//!     "args": [ { "name": "path", "type": { "name": "str8", "tag": "S" } } ],
//!     "ret": { "name": "str8", "tag": "S" }
//!   }
//! ]
//! ```
//!
//! | Tag | Meaning | Maps to |
//! |-----|---------|---------|
//! | `v` | void | no result |
//! | `i` / `I` | i32 / i64 | [`Param::I32`] / [`Param::I64`] |
//! | `f` / `F` | f32 / f64 | [`Param::F32`] / [`Param::F64`] |
//! | `p` | raw pointer | [`Param::Ptr`] (`size` bytes, default 1) |
//! | `S` | struct by pointer | [`Param::Str`] for string types, else [`Param::Ptr`] |
//!
//! Routines with any `S` argument or result are imported by the guest under
//! `<name>_argptr_stub`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::imports::{ImportDecl, ImportRegistry};
use crate::marshal::{Param, Ret, Signature};

/// Type names carried as [`StrDescriptor`](crate::marshal::StrDescriptor)s.
pub const STRING_TYPES: &[&str] = &["str8", "oc_str8"];

/// Suffix the guest uses for routines taking structs by pointer.
pub const ARGPTR_SUFFIX: &str = "_argptr_stub";

/// ABI category of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// No value
    #[serde(rename = "v")]
    Void,
    /// 32-bit integer
    #[serde(rename = "i")]
    I32,
    /// 64-bit integer
    #[serde(rename = "I")]
    I64,
    /// 32-bit float
    #[serde(rename = "f")]
    F32,
    /// 64-bit float
    #[serde(rename = "F")]
    F64,
    /// Pointer into guest memory
    #[serde(rename = "p")]
    Pointer,
    /// Struct passed by pointer
    #[serde(rename = "S")]
    Struct,
}

/// A type reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDecl {
    /// Type name as the guest spells it
    pub name: String,
    /// ABI category
    pub tag: TypeTag,
    /// Host-side C name, if different
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// Bytes the host may access behind a pointer or struct
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

impl TypeDecl {
    /// Whether this is a string descriptor type.
    pub fn is_string(&self) -> bool {
        self.tag == TypeTag::Struct && STRING_TYPES.contains(&self.name.as_str())
    }
}

/// A named argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDecl {
    /// Argument name
    pub name: String,
    /// Argument type
    #[serde(rename = "type")]
    pub ty: TypeDecl,
}

/// One routine in an interface file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDecl {
    /// Guest-facing name
    pub name: String,
    /// Host-side name, if different
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// Arguments, in order
    #[serde(default)]
    pub args: Vec<ArgDecl>,
    /// Result type
    pub ret: TypeDecl,
    /// Whether a host stub is generated (false for hand-written bindings)
    #[serde(default = "default_true")]
    pub gen_stub: bool,
}

fn default_true() -> bool {
    true
}

impl InterfaceDecl {
    /// Whether any argument or the result is a struct passed by pointer.
    pub fn uses_argptr_stub(&self) -> bool {
        self.ret.tag == TypeTag::Struct || self.args.iter().any(|a| a.ty.tag == TypeTag::Struct)
    }

    /// Name the guest imports this routine under.
    pub fn import_name(&self) -> String {
        if self.uses_argptr_stub() {
            format!("{}{}", self.name, ARGPTR_SUFFIX)
        } else {
            self.name.clone()
        }
    }

    /// Host-side name.
    pub fn host_name(&self) -> &str {
        self.cname.as_deref().unwrap_or(&self.name)
    }

    /// Declarative signature for this routine.
    pub fn signature(&self) -> Result<Signature> {
        let params = self
            .args
            .iter()
            .map(|arg| self.param(arg))
            .collect::<Result<Vec<_>>>()?;

        let results = match self.ret.tag {
            TypeTag::Void => vec![],
            TypeTag::I32 | TypeTag::Pointer => vec![Ret::I32],
            TypeTag::I64 => vec![Ret::I64],
            TypeTag::F32 => vec![Ret::F32],
            TypeTag::F64 => vec![Ret::F64],
            TypeTag::Struct if self.ret.is_string() => vec![Ret::Str],
            TypeTag::Struct => {
                return Err(HostError::Interface(format!(
                    "{}: struct result type '{}' is not supported",
                    self.name, self.ret.name
                )))
            }
        };

        Ok(Signature { params, results })
    }

    fn param(&self, arg: &ArgDecl) -> Result<Param> {
        Ok(match arg.ty.tag {
            TypeTag::I32 => Param::I32,
            TypeTag::I64 => Param::I64,
            TypeTag::F32 => Param::F32,
            TypeTag::F64 => Param::F64,
            TypeTag::Pointer => Param::Ptr {
                size: arg.ty.size.unwrap_or(1),
            },
            TypeTag::Struct if arg.ty.is_string() => Param::Str,
            TypeTag::Struct => Param::Ptr {
                size: arg.ty.size.ok_or_else(|| {
                    HostError::Interface(format!(
                        "{}: argument '{}' of struct type '{}' needs a size",
                        self.name, arg.name, arg.ty.name
                    ))
                })?,
            },
            TypeTag::Void => {
                return Err(HostError::Interface(format!(
                    "{}: argument '{}' has void type",
                    self.name, arg.name
                )))
            }
        })
    }

    /// The import a guest built against this description declares.
    pub fn import_decl(&self) -> Result<ImportDecl> {
        Ok(ImportDecl::new(self.import_name(), self.signature()?.lower()))
    }
}

/// Parse interface JSON text.
///
/// Every entry must lower to a signature and import names must be unique.
pub fn parse_interface(text: &str) -> Result<Vec<InterfaceDecl>> {
    let decls: Vec<InterfaceDecl> = serde_json::from_str(text)?;

    let mut seen = HashSet::new();
    for decl in &decls {
        decl.signature()?;
        if !seen.insert(decl.import_name()) {
            return Err(HostError::Interface(format!(
                "duplicate routine '{}'",
                decl.name
            )));
        }
    }

    tracing::debug!(routines = decls.len(), "parsed interface description");
    Ok(decls)
}

/// Load an interface file.
pub fn load_interface(path: impl AsRef<Path>) -> Result<Vec<InterfaceDecl>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    parse_interface(&text).map_err(|e| match e {
        HostError::Interface(msg) => HostError::Interface(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Imports the description declares that `registry` does not provide.
pub fn missing_imports<T>(
    registry: &ImportRegistry<T>,
    decls: &[InterfaceDecl],
) -> Result<Vec<ImportDecl>> {
    let imports = decls
        .iter()
        .map(InterfaceDecl::import_decl)
        .collect::<Result<Vec<_>>>()?;
    Ok(registry.missing(&imports))
}
