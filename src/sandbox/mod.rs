//! Untrusted-code sandbox built on disposable V8 isolates for model-generated code.
//!
//! A request resolves trusted helpers, concatenates them with the
//! submitted code, and evaluates the result in a fresh isolate that can
//! only reach the host through installed capabilities:
//! - `globals`: `require` over an allow-list, CommonJS objects, byte/text shims
//! - `log`: `console.*` captured into a log buffer
//! - `fs`: `readFileSync` scoped to the request's working directory
//!
//! The isolate is torn down on every path. Cancellation terminates it
//! out-of-band, so scripts that never yield still stop.

pub mod capabilities;
pub mod error;
pub mod executor;
pub mod helpers;
pub mod isolate;

pub use error::SandboxError;
pub use executor::{ExecuteOptions, Executor, ExecutorSettings, PassThrough, SourceTransform};
pub use helpers::HelperLoader;
pub use isolate::{DEFAULT_MEMORY_LIMIT_BYTES, Isolate, IsolateHandle, IsolateState, Outcome};
pub use tokio_util::sync::CancellationToken;
