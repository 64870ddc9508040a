//! File access confined to one directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{HostError, Result};
use crate::imports::ImportRegistry;
use crate::marshal::{Param, Ret, Returns, Signature};

/// A directory the guest may reach through relative paths.
#[derive(Debug, Clone)]
pub struct FileSandbox {
    root: PathBuf,
    writable: bool,
}

impl FileSandbox {
    /// Confine access to `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            HostError::Config(format!("files_root {}: {}", root.display(), e))
        })?;
        if !root.is_dir() {
            return Err(HostError::Config(format!(
                "files_root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root, writable })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether writes are allowed.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Map a guest path to a host path below the root.
    ///
    /// Only plain relative components are accepted. Existing targets are
    /// canonicalized so symlinks cannot lead outside the root, and dangling
    /// symlinks are refused outright.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf> {
        let relative = Path::new(guest_path);
        let mut host = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => host.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(HostError::Capability(format!(
                        "path '{}' escapes the sandbox",
                        guest_path
                    )))
                }
            }
        }
        if host == self.root {
            return Err(HostError::Capability(format!("path '{}' names no file", guest_path)));
        }

        let checked = match host.canonicalize() {
            Ok(real) => real,
            // An entry that exists but cannot be canonicalized is a dangling link
            Err(_) if std::fs::symlink_metadata(&host).is_ok() => {
                return Err(HostError::Capability(format!(
                    "path '{}' is a dangling symlink",
                    guest_path
                )))
            }
            Err(_) => match host.parent().map(Path::canonicalize) {
                Some(Ok(parent)) => parent.join(host.file_name().unwrap_or_default()),
                _ => return Ok(host),
            },
        };
        if !checked.starts_with(&self.root) {
            return Err(HostError::Capability(format!(
                "path '{}' escapes the sandbox",
                guest_path
            )));
        }
        Ok(checked)
    }

    /// Read a whole file.
    pub fn read(&self, guest_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(guest_path)?;
        std::fs::read(&path).map_err(|e| denied(guest_path, e))
    }

    /// Create or replace a file, returning the bytes written.
    pub fn write(&self, guest_path: &str, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(HostError::Capability(format!(
                "write to '{}' denied: sandbox is read-only",
                guest_path
            )));
        }
        let path = self.resolve(guest_path)?;
        std::fs::write(&path, data).map_err(|e| denied(guest_path, e))?;
        Ok(data.len())
    }

    /// Whether a file exists. Paths outside the sandbox are an error, not `false`.
    pub fn exists(&self, guest_path: &str) -> Result<bool> {
        Ok(self.resolve(guest_path)?.is_file())
    }
}

fn denied(guest_path: &str, e: std::io::Error) -> HostError {
    HostError::Capability(format!("{}: {}", guest_path, e))
}

pub(super) fn register<T: 'static>(
    registry: &mut ImportRegistry<T>,
    sandbox: Arc<FileSandbox>,
) -> Result<()> {
    let fs = Arc::clone(&sandbox);
    registry.register_routine(
        "file_read",
        Signature::new(&[Param::Str], &[Ret::Str]),
        move |_, args| Ok(Returns::one(fs.read(args.str(0)?)?)),
    )?;

    let fs = Arc::clone(&sandbox);
    registry.register_routine(
        "file_write",
        Signature::new(&[Param::Str, Param::Str], &[Ret::I32]),
        move |_, args| {
            let written = fs.write(args.str(0)?, args.bytes(1)?)?;
            let written = i32::try_from(written).map_err(|_| {
                HostError::Capability("write exceeds 2 GiB".to_string())
            })?;
            Ok(Returns::one(written))
        },
    )?;

    let fs = sandbox;
    registry.register_routine(
        "file_exists",
        Signature::new(&[Param::Str], &[Ret::I32]),
        move |_, args| Ok(Returns::one(fs.exists(args.str(0)?)? as i32)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(writable: bool) -> (tempfile::TempDir, FileSandbox) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let sandbox = FileSandbox::new(dir.path(), writable).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn test_read_inside_root() {
        let (_dir, fs) = sandbox(false);
        assert_eq!(fs.read("hello.txt").unwrap(), b"hello");
        assert_eq!(fs.read("./hello.txt").unwrap(), b"hello");
        assert!(fs.exists("hello.txt").unwrap());
        assert!(!fs.exists("absent.txt").unwrap());
    }

    #[test]
    fn test_rejects_escapes() {
        let (_dir, fs) = sandbox(true);
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", "", "."] {
            let err = fs.resolve(bad).unwrap_err();
            assert!(matches!(err, HostError::Capability(_)), "{bad}");
            assert!(err.is_guest_recoverable());
        }
    }

    #[test]
    fn test_read_only_denies_write() {
        let (dir, fs) = sandbox(false);
        assert!(matches!(fs.write("new.txt", b"x"), Err(HostError::Capability(_))));
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn test_write_when_writable() {
        let (dir, fs) = sandbox(true);
        assert_eq!(fs.write("new.txt", b"data").unwrap(), 4);
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_missing_file_is_capability_error() {
        let (_dir, fs) = sandbox(false);
        assert!(matches!(fs.read("absent.txt"), Err(HostError::Capability(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        let (dir, fs) = sandbox(false);
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();
        assert!(matches!(fs.read("link"), Err(HostError::Capability(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_out_of_root_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("absent");
        let (dir, fs) = sandbox(true);
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();

        assert!(matches!(fs.write("link", b"x"), Err(HostError::Capability(_))));
        assert!(matches!(fs.exists("link"), Err(HostError::Capability(_))));
        assert!(!target.exists());
    }
}
