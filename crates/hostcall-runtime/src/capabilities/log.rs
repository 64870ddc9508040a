//! Guest logging.

use crate::error::Result;
use crate::imports::ImportRegistry;
use crate::marshal::{Args, Param, Returns, Signature};

/// Severity as the guest encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLogLevel {
    /// 0
    Error,
    /// 1
    Warning,
    /// 2
    Info,
    /// 3
    Debug,
    /// Anything else
    Trace,
}

impl From<i32> for GuestLogLevel {
    fn from(level: i32) -> Self {
        match level {
            0 => GuestLogLevel::Error,
            1 => GuestLogLevel::Warning,
            2 => GuestLogLevel::Info,
            3 => GuestLogLevel::Debug,
            _ => GuestLogLevel::Trace,
        }
    }
}

fn guest_log<T>(_: &mut T, args: &Args<'_>) -> Result<Returns> {
    let level = GuestLogLevel::from(args.i32(0)?);
    let message = String::from_utf8_lossy(args.bytes(1)?);
    let message = message.trim_end();

    match level {
        GuestLogLevel::Error => tracing::error!(target: "guest", "{}", message),
        GuestLogLevel::Warning => tracing::warn!(target: "guest", "{}", message),
        GuestLogLevel::Info => tracing::info!(target: "guest", "{}", message),
        GuestLogLevel::Debug => tracing::debug!(target: "guest", "{}", message),
        GuestLogLevel::Trace => tracing::trace!(target: "guest", "{}", message),
    }
    Ok(Returns::none())
}

pub(super) fn register<T: 'static>(registry: &mut ImportRegistry<T>) -> Result<()> {
    registry.register_routine(
        "log",
        Signature::new(&[Param::I32, Param::Str], &[]),
        guest_log::<T>,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(GuestLogLevel::from(0), GuestLogLevel::Error);
        assert_eq!(GuestLogLevel::from(1), GuestLogLevel::Warning);
        assert_eq!(GuestLogLevel::from(2), GuestLogLevel::Info);
        assert_eq!(GuestLogLevel::from(3), GuestLogLevel::Debug);
        assert_eq!(GuestLogLevel::from(-4), GuestLogLevel::Trace);
    }
}
