//! Scoped, read-only filesystem access.
//!
//! Only `readFileSync` is ever installed. Paths are resolved against the
//! request's working directory and must stay inside it, both lexically
//! and after symlink resolution. Every failure is returned to the JS
//! wrapper as data and thrown there, so nothing here can fail the host.

use std::path::{Path, PathBuf};

use base64::Engine;
use deno_core::{OpState, op2};
use serde::{Deserialize, Serialize};

use super::{Capability, CapabilityConfig};
use crate::sandbox::error::Result;
use crate::sandbox::isolate::Isolate;

pub struct FilesystemRead;

pub const ACCESS_DENIED: &str =
    "Access denied: Cannot access paths outside of current directory.";

/// Root directory for reads, kept in the op state.
#[derive(Debug, Clone)]
pub struct ReadScope {
    root: PathBuf,
}

impl ReadScope {
    pub fn new(root: &Path) -> Self {
        Self {
            root: path_clean::clean(root),
        }
    }

    /// Resolve `requested` against the root, refusing anything that lands
    /// outside it.
    pub fn resolve(&self, requested: &str) -> std::result::Result<PathBuf, ReadFailure> {
        let resolved = path_clean::clean(self.root.join(requested));
        if !resolved.starts_with(&self.root) {
            return Err(ReadFailure::AccessDenied);
        }

        // A symlink under the root may still point elsewhere.
        if let (Ok(root), Ok(target)) = (self.root.canonicalize(), resolved.canonicalize())
            && !target.starts_with(&root)
        {
            return Err(ReadFailure::AccessDenied);
        }

        Ok(resolved)
    }

    pub fn read(&self, requested: &str, encoding: Option<&str>) -> std::result::Result<Contents, ReadFailure> {
        let path = self.resolve(requested)?;
        let bytes = std::fs::read(&path).map_err(|e| ReadFailure::Io(e.to_string()))?;
        match encoding {
            None => Ok(Contents::Bytes(bytes)),
            Some(name) => decode(&bytes, name).map(Contents::Text),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Contents {
    Bytes(Vec<u8>),
    Text(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadFailure {
    AccessDenied,
    UnknownEncoding(String),
    Io(String),
}

impl ReadFailure {
    fn error_name(&self) -> &'static str {
        match self {
            ReadFailure::AccessDenied => "AccessDeniedError",
            _ => "Error",
        }
    }

    fn message(&self) -> String {
        let detail = match self {
            ReadFailure::AccessDenied => ACCESS_DENIED.to_string(),
            ReadFailure::UnknownEncoding(name) => format!("Unknown encoding: {}", name),
            ReadFailure::Io(e) => e.clone(),
        };
        format!("Error reading file: {}", detail)
    }
}

fn decode(bytes: &[u8], encoding: &str) -> std::result::Result<String, ReadFailure> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        "latin1" | "binary" => Ok(bytes.iter().map(|&b| b as char).collect()),
        "ascii" => Ok(bytes.iter().map(|&b| (b & 0x7f) as char).collect()),
        "base64" => Ok(base64::engine::general_purpose::STANDARD.encode(bytes)),
        "hex" => Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        _ => Err(ReadFailure::UnknownEncoding(encoding.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    path: String,
    encoding: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    text: Option<String>,
    bytes: Option<Vec<u8>>,
    error: Option<String>,
    error_name: Option<String>,
}

impl From<std::result::Result<Contents, ReadFailure>> for ReadReply {
    fn from(result: std::result::Result<Contents, ReadFailure>) -> Self {
        match result {
            Ok(Contents::Text(text)) => Self {
                text: Some(text),
                ..Default::default()
            },
            Ok(Contents::Bytes(bytes)) => Self {
                bytes: Some(bytes),
                ..Default::default()
            },
            Err(failure) => Self {
                error: Some(failure.message()),
                error_name: Some(failure.error_name().to_string()),
                ..Default::default()
            },
        }
    }
}

#[op2]
#[serde]
pub fn op_jail_read_file(state: &mut OpState, #[serde] request: ReadRequest) -> ReadReply {
    let Some(scope) = state.try_borrow::<ReadScope>() else {
        return Err::<Contents, _>(ReadFailure::AccessDenied).into();
    };
    let result = scope.read(&request.path, request.encoding.as_deref());
    if let Err(ref failure) = result {
        tracing::debug!(path = %request.path, ?failure, "Sandbox read refused");
    }
    result.into()
}

const BOOTSTRAP: &str = r#"
((ops, register) => {
    const read = ops.op_jail_read_file;

    class AccessDeniedError extends Error {
        constructor(message) {
            super(message);
            this.name = "AccessDeniedError";
        }
    }

    const encodingOf = (encoding) => {
        if (encoding === undefined || encoding === null) {
            return null;
        }
        if (typeof encoding === "object") {
            return encoding.encoding ?? null;
        }
        return String(encoding);
    };

    const readFileSync = (path, encoding) => {
        const reply = read({ path: String(path), encoding: encodingOf(encoding) });
        if (reply.error !== null) {
            if (reply.errorName === "AccessDeniedError") {
                throw new AccessDeniedError(reply.error);
            }
            throw new Error(reply.error);
        }
        if (reply.text !== null) {
            return reply.text;
        }
        return new Uint8Array(reply.bytes);
    };

    register("fs", Object.freeze({ readFileSync }));
    globalThis.readFileSync = readFileSync;
})(Deno.core.ops, globalThis.__jsjail_register);
"#;

impl Capability for FilesystemRead {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn install(&self, isolate: &mut Isolate, config: &CapabilityConfig) -> Result<()> {
        isolate.put_state(ReadScope::new(&config.working_directory));
        isolate.bootstrap("[jsjail:fs]", BOOTSTRAP)
    }
}
