//! Configuration for guest instances.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HostError, Result};
use crate::memory::{GUEST_PAGE_SIZE, MAX_GUEST_MEMORY};

/// Guest linear memory sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Address space reserved up front, in bytes (rounded up to guest pages)
    pub reserve_bytes: u64,

    /// Guest pages committed at creation
    pub initial_pages: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            reserve_bytes: default_reserve(),
            initial_pages: 0,
        }
    }
}

#[cfg(target_pointer_width = "64")]
fn default_reserve() -> u64 {
    MAX_GUEST_MEMORY // 4 GiB
}

#[cfg(not(target_pointer_width = "64"))]
fn default_reserve() -> u64 {
    1 << 30 // 1 GiB
}

impl MemoryConfig {
    /// Small reservation for tests and tiny guests
    pub fn minimal() -> Self {
        Self {
            reserve_bytes: 16 * 1024 * 1024, // 16 MB
            initial_pages: 1,
        }
    }

    /// Full 32-bit guest address space
    pub fn large() -> Self {
        Self {
            reserve_bytes: MAX_GUEST_MEMORY,
            initial_pages: 16, // 1 MB
        }
    }

    /// Builder: set reservation
    pub fn reserve_bytes(mut self, bytes: u64) -> Self {
        self.reserve_bytes = bytes;
        self
    }

    /// Builder: set initial committed pages
    pub fn initial_pages(mut self, pages: u32) -> Self {
        self.initial_pages = pages;
        self
    }

    /// Reservation rounded up to whole guest pages.
    pub fn reserve_rounded(&self) -> u64 {
        let page = GUEST_PAGE_SIZE as u64;
        self.reserve_bytes.div_ceil(page) * page
    }
}

/// Host capabilities granted to guests.
///
/// Deny-by-default: only logging starts enabled, file access needs an
/// explicit root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Expose the `log` import
    pub log: bool,

    /// Directory the file imports are rooted at (None = no file imports)
    pub files_root: Option<PathBuf>,

    /// Allow `file_write`
    pub files_writable: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            log: true,
            files_root: None,
            files_writable: false,
        }
    }
}

impl CapabilityConfig {
    /// Nothing allowed
    pub fn none() -> Self {
        Self {
            log: false,
            ..Default::default()
        }
    }

    /// Builder: enable logging
    pub fn log(mut self, allow: bool) -> Self {
        self.log = allow;
        self
    }

    /// Builder: read-only file access below `root`
    pub fn files_ro(mut self, root: impl Into<PathBuf>) -> Self {
        self.files_root = Some(root.into());
        self.files_writable = false;
        self
    }

    /// Builder: read-write file access below `root`
    pub fn files_rw(mut self, root: impl Into<PathBuf>) -> Self {
        self.files_root = Some(root.into());
        self.files_writable = true;
        self
    }
}

/// Configuration for a [`GuestInstance`](crate::GuestInstance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Linear memory sizing
    pub memory: MemoryConfig,

    /// Bytes of guest memory set aside for call outputs
    pub scratch_bytes: u32,

    /// Capability grants
    pub capabilities: CapabilityConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            scratch_bytes: 64 * 1024, // 64 KB
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            memory: MemoryConfig::minimal(),
            scratch_bytes: 4 * 1024,
            capabilities: CapabilityConfig::none(),
        }
    }

    /// Config for development: large memory, logging on
    pub fn development() -> Self {
        Self {
            memory: MemoryConfig::large(),
            scratch_bytes: 1024 * 1024, // 1 MB
            capabilities: CapabilityConfig::default(),
        }
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse from JSON text; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Builder: set memory config
    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Builder: set scratch size
    pub fn scratch_bytes(mut self, bytes: u32) -> Self {
        self.scratch_bytes = bytes;
        self
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, capabilities: CapabilityConfig) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Check that the sizes fit together.
    pub fn validate(&self) -> Result<()> {
        if self.memory.reserve_bytes > MAX_GUEST_MEMORY {
            return Err(HostError::Config(format!(
                "reserve_bytes {} exceeds the 32-bit guest address space",
                self.memory.reserve_bytes
            )));
        }
        if self.scratch_bytes == 0 {
            return Err(HostError::Config("scratch_bytes must be non-zero".into()));
        }

        let reserve = self.memory.reserve_rounded();
        let initial = self.memory.initial_pages as u64 * GUEST_PAGE_SIZE as u64;
        if initial > reserve {
            return Err(HostError::Config(format!(
                "initial_pages {} exceed the {} byte reservation",
                self.memory.initial_pages, reserve
            )));
        }

        let page = GUEST_PAGE_SIZE as u64;
        let scratch = (self.scratch_bytes as u64).div_ceil(page) * page;
        if initial + scratch > reserve {
            return Err(HostError::Config(format!(
                "{} scratch bytes do not fit after {} initial bytes in a {} byte reservation",
                self.scratch_bytes, initial, reserve
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        RuntimeConfig::default().validate().unwrap();
        RuntimeConfig::minimal().validate().unwrap();
        RuntimeConfig::development().validate().unwrap();
    }

    #[test]
    fn test_capabilities_deny_by_default() {
        let caps = CapabilityConfig::default();
        assert!(caps.log);
        assert!(caps.files_root.is_none());
        assert!(!caps.files_writable);

        let none = CapabilityConfig::none();
        assert!(!none.log);
    }

    #[test]
    fn test_reserve_rounding() {
        let mem = MemoryConfig::default().reserve_bytes(100_000);
        assert_eq!(mem.reserve_rounded(), 2 * GUEST_PAGE_SIZE as u64);
    }

    #[test]
    fn test_validate_rejects_zero_scratch() {
        let config = RuntimeConfig::minimal().scratch_bytes(0);
        assert!(matches!(config.validate(), Err(HostError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_initial() {
        let config = RuntimeConfig::minimal()
            .memory(MemoryConfig::minimal().reserve_bytes(1 << 20).initial_pages(17));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_scratch_overflow() {
        let config = RuntimeConfig::minimal()
            .memory(MemoryConfig::minimal().reserve_bytes(2 * GUEST_PAGE_SIZE as u64).initial_pages(2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_partial() {
        let config = RuntimeConfig::from_json(
            r#"{ "memory": { "reserve_bytes": 1048576 }, "capabilities": { "files_root": "/tmp/guest" } }"#,
        )
        .unwrap();
        assert_eq!(config.memory.reserve_bytes, 1 << 20);
        assert_eq!(config.memory.initial_pages, 0);
        assert_eq!(config.scratch_bytes, 64 * 1024);
        assert!(config.capabilities.log);
        assert_eq!(config.capabilities.files_root, Some(PathBuf::from("/tmp/guest")));
    }

    #[test]
    fn test_json_rejects_invalid() {
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "scratch_bytes": 0 }"#),
            Err(HostError::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json("not json"),
            Err(HostError::Json(_))
        ));
    }
}
