use super::{Capability, CapabilityConfig};
use crate::sandbox::error::Result;
use crate::sandbox::isolate::Isolate;

/// Minimal global namespace: `require` over an allow-list, CommonJS
/// `module`/`exports` objects, and byte/text shims.
///
/// The module table starts empty. Later capabilities add entries through
/// a registration hook that disappears when the isolate is sealed, after
/// which the table is frozen.
pub struct Globals;

const BOOTSTRAP: &str = r#"
((globalThis) => {
    globalThis.global = globalThis;

    const modules = Object.create(null);

    class ModuleNotFoundError extends Error {
        constructor(name) {
            super(`Cannot require module ${name}`);
            this.name = "ModuleNotFoundError";
        }
    }

    globalThis.require = (name) => {
        const key = String(name);
        if (Object.prototype.hasOwnProperty.call(modules, key)) {
            return modules[key];
        }
        throw new ModuleNotFoundError(key);
    };

    Object.defineProperty(globalThis, "__jsjail_register", {
        value: (name, value) => {
            modules[name] = value;
        },
        configurable: true,
        enumerable: false,
        writable: false,
    });
    Object.defineProperty(globalThis, "__jsjail_seal", {
        value: () => {
            Object.freeze(modules);
        },
        configurable: true,
        enumerable: false,
        writable: false,
    });

    globalThis.exports = {};
    globalThis.module = { exports: globalThis.exports };

    class TextEncoder {
        get encoding() {
            return "utf-8";
        }

        encode(input = "") {
            const out = [];
            for (const ch of String(input)) {
                let cp = ch.codePointAt(0);
                if (cp >= 0xd800 && cp <= 0xdfff) {
                    cp = 0xfffd;
                }
                if (cp < 0x80) {
                    out.push(cp);
                } else if (cp < 0x800) {
                    out.push(0xc0 | (cp >> 6), 0x80 | (cp & 0x3f));
                } else if (cp < 0x10000) {
                    out.push(
                        0xe0 | (cp >> 12),
                        0x80 | ((cp >> 6) & 0x3f),
                        0x80 | (cp & 0x3f),
                    );
                } else {
                    out.push(
                        0xf0 | (cp >> 18),
                        0x80 | ((cp >> 12) & 0x3f),
                        0x80 | ((cp >> 6) & 0x3f),
                        0x80 | (cp & 0x3f),
                    );
                }
            }
            return new Uint8Array(out);
        }
    }
    globalThis.TextEncoder = TextEncoder;

    globalThis.Buffer = Object.freeze({
        isBuffer: (value) => value instanceof Uint8Array,
        from: (input) => {
            if (typeof input === "string") {
                return new TextEncoder().encode(input);
            }
            if (input instanceof ArrayBuffer) {
                return new Uint8Array(input);
            }
            if (ArrayBuffer.isView(input)) {
                return new Uint8Array(input.buffer, input.byteOffset, input.byteLength);
            }
            if (Array.isArray(input)) {
                return Uint8Array.from(input);
            }
            return input;
        },
    });
})(globalThis);
"#;

impl Capability for Globals {
    fn name(&self) -> &'static str {
        "globals"
    }

    fn install(&self, isolate: &mut Isolate, _config: &CapabilityConfig) -> Result<()> {
        isolate.bootstrap("[jsjail:globals]", BOOTSTRAP)
    }
}
