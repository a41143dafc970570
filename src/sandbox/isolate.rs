//! Isolate lifecycle: create, install capabilities, run, dispose.
//!
//! An [`Isolate`] wraps one `deno_core::JsRuntime` with a V8 heap ceiling.
//! It is `!Send` and lives on the thread that created it. The matching
//! [`IsolateHandle`] is `Send + Sync` and is what the cancellation path
//! holds: disposing through it terminates whatever JavaScript is running,
//! whether or not the script ever yields.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions, v8};
use tracing::{debug, warn};

use super::capabilities::{self, Capability, CapabilityConfig, LogBuffer};
use super::error::{Result, SandboxError};

/// Default V8 heap ceiling: 128 MiB.
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 128 * 1024 * 1024;

/// Smallest ceiling accepted; V8 cannot boot a context below this.
pub const MIN_MEMORY_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Extra heap granted once the ceiling is hit, so termination can unwind.
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateState {
    Created,
    CapabilitiesInstalled,
    Running,
    Completed,
    Faulted,
    Aborted,
    Disposed,
}

/// How an evaluation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Uncaught sandbox error or memory exhaustion; carries the log line.
    Faulted(String),
    /// Disposed out from under the evaluation.
    Aborted,
}

/// Thread-safe teardown switch for one isolate.
///
/// Created before the isolate exists so cancellation can be wired up
/// first; a dispose that arrives before [`Isolate::create`] attaches the
/// engine handle is honoured at attach time.
#[derive(Default)]
pub struct IsolateHandle {
    // One lock for both fields so dispose and attach always see each other.
    inner: Mutex<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    disposed: bool,
    engine: Option<v8::IsolateHandle>,
}

impl IsolateHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the isolate disposed and terminate any running script.
    /// Returns `true` for the first call only.
    pub fn dispose(&self) -> bool {
        let mut inner = self.lock();
        let first = !inner.disposed;
        inner.disposed = true;
        if let Some(engine) = inner.engine.as_ref() {
            engine.terminate_execution();
        }
        first
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn attach(&self, engine: v8::IsolateHandle) {
        let mut inner = self.lock();
        if inner.disposed {
            engine.terminate_execution();
        }
        inner.engine.get_or_insert(engine);
    }
}

struct HeapLimitState {
    engine: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the `HeapLimitState` boxed inside the owning
    // `Isolate`, which drops its runtime before the box.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.engine.terminate_execution();
    }
    current_heap_limit + HEAP_GRACE_BYTES
}

/// Byte budget for ArrayBuffer backing stores, which live outside the V8
/// heap. Allocations past the limit are refused and flag the isolate.
struct BackingStoreBudget {
    limit: usize,
    used: AtomicUsize,
    exceeded: AtomicBool,
}

impl BackingStoreBudget {
    fn charge(&self, len: usize) -> bool {
        let charged = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|total| *total <= self.limit)
            })
            .is_ok();
        if !charged {
            self.exceeded.store(true, Ordering::SeqCst);
        }
        charged
    }

    fn release(&self, len: usize) {
        self.used.fetch_sub(len, Ordering::SeqCst);
    }

    fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }
}

// The allocator callbacks must not call back into V8. A null return makes
// V8 throw a RangeError in the script.

unsafe extern "C" fn budget_allocate(budget: &BackingStoreBudget, len: usize) -> *mut c_void {
    if !budget.charge(len) {
        return std::ptr::null_mut();
    }
    Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8 as *mut c_void
}

unsafe extern "C" fn budget_allocate_uninitialized(
    budget: &BackingStoreBudget,
    len: usize,
) -> *mut c_void {
    // SAFETY: `budget_allocate` has no preconditions beyond ours.
    unsafe { budget_allocate(budget, len) }
}

unsafe extern "C" fn budget_free(budget: &BackingStoreBudget, data: *mut c_void, len: usize) {
    if data.is_null() {
        return;
    }
    budget.release(len);
    // SAFETY: `data` came from `budget_allocate` with the same `len`.
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(data as *mut u8, len)) });
}

unsafe extern "C" fn budget_drop(budget: *const BackingStoreBudget) {
    // SAFETY: balances the `Arc::into_raw` in `backing_store_allocator`.
    drop(unsafe { Arc::from_raw(budget) });
}

static BUDGET_VTABLE: v8::RustAllocatorVtable<BackingStoreBudget> = v8::RustAllocatorVtable {
    allocate: budget_allocate,
    allocate_uninitialized: budget_allocate_uninitialized,
    free: budget_free,
    drop: budget_drop,
};

fn backing_store_allocator(budget: &Arc<BackingStoreBudget>) -> v8::UniqueRef<v8::Allocator> {
    // SAFETY: the allocator owns one strong count, released in `budget_drop`.
    unsafe { v8::new_rust_allocator(Arc::into_raw(budget.clone()), &BUDGET_VTABLE) }
}

/// A fresh, memory-bounded JavaScript environment. Single use.
pub struct Isolate {
    // Dropped before `heap` (field order), which the heap callback relies on.
    runtime: Option<JsRuntime>,
    heap: Box<HeapLimitState>,
    backing_stores: Arc<BackingStoreBudget>,
    handle: Arc<IsolateHandle>,
    state: IsolateState,
    memory_limit_bytes: usize,
}

impl Isolate {
    /// Allocate an isolate with a hard memory ceiling and attach `handle`.
    ///
    /// The ceiling bounds the V8 heap and, separately, the bytes held by
    /// ArrayBuffer backing stores.
    pub fn create(memory_limit_bytes: usize, handle: Arc<IsolateHandle>) -> Result<Self> {
        if memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES {
            return Err(SandboxError::Resource(format!(
                "memory limit of {} bytes is below the minimum of {} bytes",
                memory_limit_bytes, MIN_MEMORY_LIMIT_BYTES
            )));
        }

        let backing_stores = Arc::new(BackingStoreBudget {
            limit: memory_limit_bytes,
            used: AtomicUsize::new(0),
            exceeded: AtomicBool::new(false),
        });
        let create_params = v8::CreateParams::default()
            .heap_limits(0, memory_limit_bytes)
            .array_buffer_allocator(backing_store_allocator(&backing_stores));
        let mut runtime = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            JsRuntime::new(RuntimeOptions {
                extensions: vec![capabilities::extension()],
                create_params: Some(create_params),
                ..Default::default()
            })
        }))
        .map_err(|_| {
            SandboxError::Resource(format!(
                "V8 could not create an isolate with a {} byte heap",
                memory_limit_bytes
            ))
        })?;

        let heap = Box::new(HeapLimitState {
            engine: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap as *const HeapLimitState as *mut c_void,
        );
        handle.attach(runtime.v8_isolate().thread_safe_handle());

        debug!(memory_limit_bytes, "Isolate created");

        Ok(Self {
            runtime: Some(runtime),
            heap,
            backing_stores,
            handle,
            state: IsolateState::Created,
            memory_limit_bytes,
        })
    }

    pub fn state(&self) -> IsolateState {
        self.state
    }

    fn runtime(&mut self) -> Result<&mut JsRuntime> {
        self.runtime.as_mut().ok_or(SandboxError::Aborted)
    }

    /// Evaluate a trusted setup script. Used by capabilities.
    pub fn bootstrap(&mut self, name: &'static str, source: &'static str) -> Result<()> {
        if self.handle.is_disposed() {
            return Err(SandboxError::Aborted);
        }
        self.runtime()?
            .execute_script(name, source)
            .map(|_| ())
            .map_err(|e| SandboxError::Runtime(format!("{}: {}", name, e)))
    }

    /// Store host-side state reachable from capability ops.
    pub fn put_state<T: 'static>(&mut self, value: T) {
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.op_state().borrow_mut().put(value);
        }
    }

    /// Install `modules` in the order given, then seal the global scope.
    pub fn install_capabilities(
        &mut self,
        modules: &[Box<dyn Capability>],
        config: &CapabilityConfig,
    ) -> Result<()> {
        if self.state != IsolateState::Created {
            return Err(SandboxError::Runtime(format!(
                "capabilities cannot be installed in state {:?}",
                self.state
            )));
        }

        for module in modules {
            module.install(self, config)?;
            debug!(capability = module.name(), "Capability installed");
        }

        self.bootstrap("[jsjail:seal]", SEAL)?;
        self.state = IsolateState::CapabilitiesInstalled;
        Ok(())
    }

    /// Evaluate `code`, driving the event loop until its completion value
    /// settles and every job it queued has run.
    pub async fn run(&mut self, code: String) -> Outcome {
        if self.handle.is_disposed() {
            self.state = IsolateState::Aborted;
            return Outcome::Aborted;
        }
        let Some(runtime) = self.runtime.as_mut() else {
            self.state = IsolateState::Aborted;
            return Outcome::Aborted;
        };
        self.state = IsolateState::Running;

        let started = Instant::now();
        let result = match runtime.execute_script("[jsjail:code]", code) {
            Ok(value) => {
                let completion = Box::pin(runtime.resolve(value));
                let settled = runtime
                    .with_event_loop_promise(completion, PollEventLoopOptions::default())
                    .await;
                // A non-promise completion resolves without polling, so
                // queued microtasks and rejections are drained here.
                match settled {
                    Ok(_) => runtime
                        .run_event_loop(PollEventLoopOptions::default())
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            Err(e) => Err(e.to_string()),
        };
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Code evaluated");

        let outcome = if self.handle.is_disposed() {
            Outcome::Aborted
        } else if self.heap.triggered.load(Ordering::SeqCst) || self.backing_stores.is_exceeded() {
            Outcome::Faulted(format!(
                "ResourceError: memory limit of {} bytes exceeded",
                self.memory_limit_bytes
            ))
        } else {
            match result {
                Ok(()) => Outcome::Completed,
                Err(message) => Outcome::Faulted(fault_line(&message)),
            }
        };

        self.state = match outcome {
            Outcome::Completed => IsolateState::Completed,
            Outcome::Faulted(_) => IsolateState::Faulted,
            Outcome::Aborted => IsolateState::Aborted,
        };
        if let Outcome::Faulted(ref line) = outcome {
            warn!(fault = %line, "Sandboxed code faulted");
        }
        outcome
    }

    /// Append a fault message to the log buffer.
    pub fn record_fault(&mut self, line: String) {
        if let Some(runtime) = self.runtime.as_mut() {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            if let Some(buffer) = state.try_borrow_mut::<LogBuffer>() {
                buffer.push_fault(line);
            }
        }
    }

    /// Take the captured output. Empty if the log capability never ran.
    pub fn take_logs(&mut self) -> String {
        self.runtime
            .as_mut()
            .and_then(|runtime| runtime.op_state().borrow_mut().try_take::<LogBuffer>())
            .map(LogBuffer::flush)
            .unwrap_or_default()
    }

    /// Tear the isolate down. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.handle.dispose();
            drop(runtime);
            debug!(final_state = ?self.state, "Isolate disposed");
            self.state = IsolateState::Disposed;
        }
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Drops the install-time hooks, freezes the module table and removes
/// the engine's privileged namespaces.
const SEAL: &str = r#"
(() => {
    const seal = globalThis.__jsjail_seal;
    delete globalThis.__jsjail_register;
    delete globalThis.__jsjail_seal;
    if (typeof seal === "function") {
        seal();
    }
    delete globalThis.Deno;
    delete globalThis.__bootstrap;
})();
"#;

/// First line of an engine error report, without the stack trace.
fn fault_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("Uncaught error")
        .to_string()
}
