//! `console` capability.
//!
//! Arguments are stringified inside the sandbox and copied across the
//! boundary as owned strings; the host never holds a reference into the
//! isolate's heap. Lines accumulate in a [`LogBuffer`] kept in the op
//! state and are read once, at teardown.

use deno_core::{OpState, op2};

use super::{Capability, CapabilityConfig};
use crate::sandbox::error::Result;
use crate::sandbox::isolate::Isolate;

pub struct Log;

/// Ordered, append-only capture of sandbox output.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Vec<String>,
    bytes: usize,
    max_bytes: usize,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Default::default()
        }
    }

    /// Append a line produced by sandboxed code. Lines past the byte cap
    /// are counted and discarded.
    pub fn push(&mut self, line: String) {
        if self.bytes + line.len() > self.max_bytes {
            self.dropped += 1;
            return;
        }
        self.bytes += line.len();
        self.lines.push(line);
    }

    /// Append a fault or abort message. Always recorded.
    pub fn push_fault(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Consume the buffer into one newline-joined string.
    pub fn flush(mut self) -> String {
        if self.dropped > 0 {
            self.lines
                .push(format!("[log truncated: {} lines dropped]", self.dropped));
        }
        self.lines.join("\n")
    }
}

#[op2]
pub fn op_jail_log(state: &mut OpState, #[serde] args: Vec<String>) {
    if let Some(buffer) = state.try_borrow_mut::<LogBuffer>() {
        buffer.push(args.join(" "));
    }
}

const BOOTSTRAP: &str = r#"
((ops) => {
    const send = ops.op_jail_log;

    const marshal = (arg) => {
        if (typeof arg === "object" && arg !== null) {
            try {
                const json = JSON.stringify(arg);
                return json === undefined ? String(arg) : json;
            } catch {
                return String(arg);
            }
        }
        return String(arg);
    };

    const write = (...args) => {
        try {
            send(args.map((arg) => {
                try {
                    return marshal(arg);
                } catch {
                    return "[unprintable]";
                }
            }));
        } catch {
            // output is best effort; never surface into sandboxed code
        }
    };

    Object.defineProperty(globalThis, "console", {
        value: Object.freeze({ log: write, error: write, warn: write, info: write }),
        configurable: true,
        enumerable: false,
        writable: true,
    });
})(Deno.core.ops);
"#;

impl Capability for Log {
    fn name(&self) -> &'static str {
        "log"
    }

    fn install(&self, isolate: &mut Isolate, config: &CapabilityConfig) -> Result<()> {
        isolate.put_state(LogBuffer::new(config.max_log_bytes));
        isolate.bootstrap("[jsjail:log]", BOOTSTRAP)
    }
}
