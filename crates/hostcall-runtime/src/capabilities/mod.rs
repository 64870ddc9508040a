//! Built-in host capabilities.
//!
//! Capabilities are ordinary declarative routines registered into an
//! [`ImportRegistry`]. What gets registered is decided by
//! [`CapabilityConfig`]; a guest that imports a capability that was not
//! granted fails to link.
//!
//! | Import | Signature | Granted by |
//! |--------|-----------|------------|
//! | `log` | `(level: i32, message: Str)` | `log` |
//! | `file_read` | `(path: Str) -> Str` | `files_root` |
//! | `file_write` | `(path: Str, data: Str) -> i32` | `files_root` (+ `files_writable`) |
//! | `file_exists` | `(path: Str) -> i32` | `files_root` |

mod files;
mod log;

pub use files::FileSandbox;
pub use log::GuestLogLevel;

use std::sync::Arc;

use crate::config::CapabilityConfig;
use crate::error::Result;
use crate::imports::ImportRegistry;

/// Register every capability `config` grants.
pub fn register_builtin<T: 'static>(
    registry: &mut ImportRegistry<T>,
    config: &CapabilityConfig,
) -> Result<()> {
    if config.log {
        log::register(registry)?;
    }

    if let Some(root) = &config.files_root {
        let sandbox = Arc::new(FileSandbox::new(root, config.files_writable)?);
        files::register(registry, sandbox)?;
    }

    tracing::debug!(
        log = config.log,
        files = config.files_root.is_some(),
        writable = config.files_writable,
        "registered host capabilities"
    );
    Ok(())
}
