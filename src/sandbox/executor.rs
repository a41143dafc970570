//! Public entry point: run helpers plus untrusted code in a fresh isolate.
//!
//! V8 isolates are `!Send`, so every request gets a dedicated thread with
//! its own current-thread tokio runtime. The caller-facing future only
//! waits on that thread and on the cancellation token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capabilities::{self, CapabilityConfig};
use super::error::{Result, SandboxError};
use super::helpers::HelperLoader;
use super::isolate::{DEFAULT_MEMORY_LIMIT_BYTES, Isolate, IsolateHandle, Outcome};
use crate::config::SandboxConfig;

/// Normalises concatenated source into the dialect the isolate evaluates.
///
/// Runs before execution on trusted input; the default passes source
/// through unchanged.
pub trait SourceTransform: Send + Sync {
    fn transform(&self, source: String) -> Result<String>;
}

pub struct PassThrough;

impl SourceTransform for PassThrough {
    fn transform(&self, source: String) -> Result<String> {
        Ok(source)
    }
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Root for the sandbox's scoped file reads.
    pub working_directory: PathBuf,
    /// Fired by the caller (or its deadline timer) to abort.
    pub cancel: CancellationToken,
    /// Overrides the executor's heap ceiling for this request.
    pub memory_limit_bytes: Option<usize>,
}

impl ExecuteOptions {
    pub fn new(working_directory: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            working_directory: working_directory.into(),
            cancel,
            memory_limit_bytes: None,
        }
    }
}

/// Settings shared by every request an executor runs.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub memory_limit_bytes: usize,
    pub max_log_bytes: usize,
    /// How long an aborted request waits for its isolate thread to finish.
    pub abort_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_log_bytes: 1_048_576,
            abort_grace: Duration::from_millis(250),
        }
    }
}

impl From<&SandboxConfig> for ExecutorSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            max_log_bytes: config.max_log_bytes,
            abort_grace: Duration::from_millis(config.abort_grace_ms),
        }
    }
}

/// Runs execution requests. Holds no per-request state; every call
/// builds and disposes its own isolate.
pub struct Executor {
    helpers: HelperLoader,
    settings: ExecutorSettings,
    transform: Arc<dyn SourceTransform>,
}

/// Disposes the isolate if the request future is dropped early.
struct DisposeOnDrop(Arc<IsolateHandle>);

impl Drop for DisposeOnDrop {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

impl Executor {
    pub fn new(helpers: HelperLoader, settings: ExecutorSettings) -> Self {
        Self {
            helpers,
            settings,
            transform: Arc::new(PassThrough),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(HelperLoader::new(config.helpers_path()), config.into())
    }

    pub fn with_transform(mut self, transform: Arc<dyn SourceTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn helpers(&self) -> &HelperLoader {
        &self.helpers
    }

    /// Run `helper_names` (in order) followed by `code`, returning the
    /// captured log output.
    ///
    /// Errors raised by the sandboxed code come back as log lines, not as
    /// `Err`. The only sandbox-originated failure is
    /// [`SandboxError::Aborted`], returned when `options.cancel` fires
    /// before the code finishes.
    pub async fn execute(
        &self,
        helper_names: &[String],
        code: &str,
        options: ExecuteOptions,
    ) -> Result<String> {
        debug!(helpers = ?helper_names, code_len = code.len(), "execute: starting");

        if options.cancel.is_cancelled() {
            return Err(SandboxError::Aborted);
        }

        let unit = self.helpers.resolve(helper_names, code)?;
        let unit = self.transform.transform(unit)?;

        let working_directory = path_clean::clean(std::path::absolute(&options.working_directory)?);
        let capability_config = CapabilityConfig {
            working_directory,
            max_log_bytes: self.settings.max_log_bytes,
        };
        let memory_limit = options
            .memory_limit_bytes
            .unwrap_or(self.settings.memory_limit_bytes);

        let handle = IsolateHandle::new();
        let _guard = DisposeOnDrop(handle.clone());

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let thread_handle = handle.clone();
        std::thread::Builder::new()
            .name("jsjail-isolate".to_string())
            .spawn(move || {
                let result = run_on_current_thread(unit, memory_limit, capability_config, thread_handle);
                if tx.send(result).is_err() {
                    debug!("sandbox result receiver dropped");
                }
            })?;

        let result = tokio::select! {
            result = &mut rx => result
                .map_err(|_| SandboxError::Runtime("sandbox thread panicked".to_string()))?,
            _ = options.cancel.cancelled() => {
                handle.dispose();
                if tokio::time::timeout(self.settings.abort_grace, rx).await.is_err() {
                    warn!(
                        grace_ms = self.settings.abort_grace.as_millis() as u64,
                        "Isolate still tearing down after abort"
                    );
                }
                Err(SandboxError::Aborted)
            }
        };

        match &result {
            Ok(logs) => info!(log_bytes = logs.len(), "execute: complete"),
            Err(e) => warn!(error = %e, "execute: failed"),
        }
        result
    }
}

fn run_on_current_thread(
    unit: String,
    memory_limit: usize,
    config: CapabilityConfig,
    handle: Arc<IsolateHandle>,
) -> Result<String> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_request(unit, memory_limit, config, handle))
}

async fn run_request(
    unit: String,
    memory_limit: usize,
    config: CapabilityConfig,
    handle: Arc<IsolateHandle>,
) -> Result<String> {
    let mut isolate = Isolate::create(memory_limit, handle)?;
    isolate.install_capabilities(&capabilities::standard(), &config)?;

    match isolate.run(unit).await {
        Outcome::Aborted => return Err(SandboxError::Aborted),
        Outcome::Faulted(line) => isolate.record_fault(line),
        Outcome::Completed => {}
    }

    let logs = isolate.take_logs();
    isolate.dispose();
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    const BIG_INT_MATH: &str = include_str!("../../helpers/big_int_math.js");
    const FILE: &str = include_str!("../../helpers/file.js");

    struct Fixture {
        _tmp: tempfile::TempDir,
        executor: Executor,
        work: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let helpers = tmp.path().join("helpers");
        let work = tmp.path().join("work");
        fs::create_dir_all(&helpers).unwrap();
        fs::create_dir_all(&work).unwrap();
        fs::write(helpers.join("big_int_math.js"), BIG_INT_MATH).unwrap();
        fs::write(helpers.join("file.js"), FILE).unwrap();
        fs::write(helpers.join("h1.js"), "const h1 = 'one';").unwrap();
        fs::write(helpers.join("h2.js"), "const h2 = h1 + '+two';").unwrap();
        fs::write(work.join("test.txt"), "hello world").unwrap();
        fs::write(tmp.path().join("secret.txt"), "TOP-SECRET-DATA").unwrap();

        let executor = Executor::new(HelperLoader::new(&helpers), ExecutorSettings::default());
        Fixture {
            _tmp: tmp,
            executor,
            work,
        }
    }

    impl Fixture {
        async fn run(&self, helpers: &[&str], code: &str) -> Result<String> {
            let helpers: Vec<String> = helpers.iter().map(|h| h.to_string()).collect();
            self.executor
                .execute(&helpers, code, ExecuteOptions::new(&self.work, CancellationToken::new()))
                .await
        }
    }

    #[tokio::test]
    async fn helper_functions_are_callable() {
        let fx = fixture();
        let out = fx
            .run(&["big_int_math.js"], r#"console.log(add("123", "456"));"#)
            .await
            .unwrap();
        assert!(out.contains("579"));
    }

    #[tokio::test]
    async fn big_int_helpers_handle_large_values() {
        let fx = fixture();
        let code = r#"
            console.log(multiply("99", "99"), compare("10", "9"), compare("007", "7"));
            console.log(add("99999999999999999999", "1"));
        "#;
        assert_eq!(
            fx.run(&["big_int_math.js"], code).await.unwrap(),
            "9801 1 0\n100000000000000000000"
        );
    }

    #[tokio::test]
    async fn logs_keep_order() {
        let fx = fixture();
        let out = fx
            .run(&[], r#"console.log("start"); console.log("end");"#)
            .await
            .unwrap();
        assert_eq!(out, "start\nend");
    }

    #[tokio::test]
    async fn log_marshals_values() {
        let fx = fixture();
        let code = r#"
            const cyclic = {}; cyclic.self = cyclic;
            console.log("n", 42, { a: [1, 2] }, null, undefined);
            console.warn(cyclic);
            console.error(true);
            console.info([1, "x"]);
        "#;
        let out = fx.run(&[], code).await.unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], r#"n 42 {"a":[1,2]} null undefined"#);
        assert_eq!(lines[1], "[object Object]");
        assert_eq!(lines[2], "true");
        assert_eq!(lines[3], r#"[1,"x"]"#);
    }

    #[tokio::test]
    async fn uncaught_error_becomes_one_log_line() {
        let fx = fixture();
        let out = fx
            .run(&[], "console.log('before');\nthrow new Error('oops');")
            .await
            .unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "before");
        assert!(lines[1].contains("Error: oops"));
    }

    #[tokio::test]
    async fn rejected_promise_is_a_fault() {
        let fx = fixture();
        let out = fx
            .run(&[], "(async () => { await null; throw new Error('later'); })()")
            .await
            .unwrap();
        assert!(out.contains("later"));
    }

    #[tokio::test]
    async fn syntax_error_is_a_fault() {
        let fx = fixture();
        let out = fx.run(&[], "this is not javascript").await.unwrap();
        assert!(out.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn async_work_is_awaited() {
        let fx = fixture();
        let code = r#"
            (async () => {
                await Promise.resolve();
                console.log("after await");
            })();
        "#;
        assert_eq!(fx.run(&[], code).await.unwrap(), "after await");
    }

    #[tokio::test]
    async fn queued_work_runs_after_plain_completion() {
        let fx = fixture();
        let code = "async function main() { await null; console.log('x'); }\nmain();\nconsole.log('done');";
        assert_eq!(fx.run(&[], code).await.unwrap(), "done\nx");
    }

    #[tokio::test]
    async fn late_rejection_is_recorded() {
        let fx = fixture();
        let code = "(async () => { await null; throw new Error('later') })(); console.log('done')";
        let output = fx.run(&[], code).await.unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2, "{output}");
        assert_eq!(lines[0], "done");
        assert!(lines[1].contains("Error: later"), "{output}");
    }

    #[tokio::test]
    async fn unknown_module_is_denied_by_name() {
        let fx = fixture();
        let out = fx
            .run(&[], "const inspector = require('node:inspector');")
            .await
            .unwrap();
        assert!(out.contains("Cannot require module node:inspector"));
        assert!(out.contains("ModuleNotFoundError"));
    }

    #[tokio::test]
    async fn caught_module_error_continues() {
        let fx = fixture();
        let code = r#"
            try { require("child_process"); } catch (e) { console.log(e.name); }
            console.log("still running");
        "#;
        assert_eq!(
            fx.run(&[], code).await.unwrap(),
            "ModuleNotFoundError\nstill running"
        );
    }

    #[tokio::test]
    async fn fs_module_is_registered() {
        let fx = fixture();
        let out = fx
            .run(&[], "const fs = require('fs'); console.log(typeof fs.readFileSync);")
            .await
            .unwrap();
        assert_eq!(out, "function");
    }

    #[tokio::test]
    async fn reads_inside_working_directory() {
        let fx = fixture();
        let out = fx
            .run(&["file.js"], r#"console.log(readFile("test.txt", "utf-8"));"#)
            .await
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn raw_read_returns_bytes() {
        let fx = fixture();
        let code = r#"
            const data = readFileSync("test.txt");
            console.log(Buffer.isBuffer(data), data.length, data[0]);
        "#;
        assert_eq!(fx.run(&[], code).await.unwrap(), "true 11 104");
    }

    #[tokio::test]
    async fn reads_outside_working_directory_are_denied() {
        let fx = fixture();
        let secret = fx.work.parent().unwrap().join("secret.txt");
        let code = format!(
            r#"
            for (const p of ["../secret.txt", {:?}]) {{
                try {{
                    console.log(readFileSync(p, "utf8"));
                }} catch (e) {{
                    console.log(e.name + ": " + e.message);
                }}
            }}
            "#,
            secret.to_str().unwrap()
        );
        let out = fx.run(&[], &code).await.unwrap();
        assert!(out.contains("Access denied"));
        assert_eq!(out.matches("AccessDeniedError").count(), 2);
        assert!(!out.contains("TOP-SECRET-DATA"));
    }

    #[tokio::test]
    async fn uncaught_denied_read_is_logged() {
        let fx = fixture();
        let out = fx
            .run(&["file.js"], r#"readFile("../secret.txt", "utf8");"#)
            .await
            .unwrap();
        assert!(out.contains("Access denied"));
        assert!(!out.contains("TOP-SECRET-DATA"));
    }

    #[tokio::test]
    async fn helper_concatenation_matches_manual_concatenation() {
        let fx = fixture();
        let code = "console.log(h2);";
        let via_helpers = fx.run(&["h1.js", "h2.js"], code).await.unwrap();
        let manual = fx
            .run(&[], "const h1 = 'one';\nconst h2 = h1 + '+two';\nconsole.log(h2);")
            .await
            .unwrap();
        assert_eq!(via_helpers, manual);
        assert_eq!(manual, "one+two");
    }

    #[tokio::test]
    async fn bad_helper_name_is_path_violation() {
        let fx = fixture();
        let err = fx.run(&["../secret.txt"], "").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathViolation { .. }));
    }

    #[tokio::test]
    async fn missing_helper_is_not_found() {
        let fx = fixture();
        let err = fx.run(&["nope.js"], "").await.unwrap_err();
        assert!(matches!(err, SandboxError::HelperNotFound { .. }));
    }

    #[tokio::test]
    async fn no_state_leaks_between_requests() {
        let fx = fixture();
        fx.run(&[], "globalThis.leaked = 1; exports.x = 2;").await.unwrap();
        let out = fx
            .run(&[], "console.log(typeof leaked, JSON.stringify(exports));")
            .await
            .unwrap();
        assert_eq!(out, "undefined {}");
    }

    #[tokio::test]
    async fn shims_are_present() {
        let fx = fixture();
        let code = r#"
            console.log(global === globalThis, module.exports === exports);
            console.log(Array.from(new TextEncoder().encode("é")).join(","));
            console.log(Buffer.from("ab").length, Object.keys(Buffer).sort().join(","));
        "#;
        assert_eq!(
            fx.run(&[], code).await.unwrap(),
            "true true\n195,169\n2 from,isBuffer"
        );
    }

    #[tokio::test]
    async fn memory_ceiling_is_captured_in_log() {
        let fx = fixture();
        let helpers: Vec<String> = Vec::new();
        let mut options = ExecuteOptions::new(&fx.work, CancellationToken::new());
        options.memory_limit_bytes = Some(16 * 1024 * 1024);
        let out = fx
            .executor
            .execute(
                &helpers,
                "const a = []; while (true) { a.push(new Array(100000).fill('x')); }",
                options,
            )
            .await
            .unwrap();
        assert!(out.contains("memory limit"));
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_immediately() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .executor
            .execute(&[], "console.log('never')", ExecuteOptions::new(&fx.work, cancel))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.to_string(), "Operation aborted");
    }

    #[tokio::test]
    async fn infinite_loop_is_aborted_by_token() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = fx
            .executor
            .execute(&[], "while (true) {}", ExecuteOptions::new(&fx.work, cancel))
            .await
            .unwrap_err();

        assert!(err.is_aborted(), "expected abort, got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn loop_that_swallows_errors_is_still_aborted() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let code = "for (;;) { try { while (true) {} } catch (e) {} finally { console.log('x'); } }";
        let err = fx
            .executor
            .execute(&[], code, ExecuteOptions::new(&fx.work, cancel))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }
}
