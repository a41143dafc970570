use std::path::PathBuf;

/// Failures that escape the sandbox and reach the caller.
///
/// Anything the sandboxed code does wrong (thrown errors, unknown modules,
/// denied reads, heap exhaustion) is captured as log output instead; only
/// the variants below ever surface from [`crate::sandbox::Executor::execute`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The cancellation token fired before or during execution.
    #[error("Operation aborted")]
    Aborted,

    /// A helper name tried to leave the trusted helper root.
    #[error("Invalid helper name: {name}")]
    PathViolation { name: String },

    #[error("Helper not found: {name}")]
    HelperNotFound { name: String, path: PathBuf },

    /// The isolate could not be allocated.
    #[error("Failed to allocate isolate: {0}")]
    Resource(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Host-side failure while wiring up or driving the isolate.
    #[error("Sandbox runtime error: {0}")]
    Runtime(String),
}

impl SandboxError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, SandboxError::Aborted)
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
