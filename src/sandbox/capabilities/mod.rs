//! Capability modules: the only ways sandboxed code can touch the host.
//!
//! Each module installs a JS-side surface (a bootstrap script) and, where
//! it needs one, host state reached through a `deno_core` op. The ops for
//! every module live in one extension registered at isolate creation; a
//! capability that is not installed leaves its op unreachable because the
//! engine's `Deno` namespace is removed when the isolate is sealed.

pub mod fs;
pub mod globals;
pub mod log;

use std::path::PathBuf;

use deno_core::Extension;

use super::error::Result;
use super::isolate::Isolate;

use self::fs::op_jail_read_file;
use self::log::op_jail_log;

pub use self::fs::FilesystemRead;
pub use self::globals::Globals;
pub use self::log::{Log, LogBuffer};

deno_core::extension!(jsjail_ext, ops = [op_jail_log, op_jail_read_file]);

/// The extension carrying every capability op.
pub(crate) fn extension() -> Extension {
    jsjail_ext::init()
}

/// Per-request settings handed to each capability's `install`.
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    /// Absolute root for scoped filesystem reads.
    pub working_directory: PathBuf,
    /// Upper bound on buffered log output.
    pub max_log_bytes: usize,
}

/// A unit granting the sandbox one narrow ability.
pub trait Capability {
    fn name(&self) -> &'static str;
    fn install(&self, isolate: &mut Isolate, config: &CapabilityConfig) -> Result<()>;
}

/// The full capability surface, in install order.
///
/// `Globals` must come first: `Log` and `FilesystemRead` rely on the
/// module table and shims it defines.
pub fn standard() -> Vec<Box<dyn Capability>> {
    vec![Box::new(Globals), Box::new(Log), Box::new(FilesystemRead)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_is_globals_log_fs() {
        let names: Vec<_> = standard().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["globals", "log", "fs"]);
    }
}
