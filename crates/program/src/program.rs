//! Program: one sandboxed guest environment
//!
//! A `Program` owns exactly one engine runtime and two contexts (`main` for
//! guest code, `safe` for host helper stubs), a module graph, a set of
//! dispose hooks and a disposed flag. All engine work happens on the
//! program's isolate thread; this module is the host-side handle and the
//! teardown choreography.
//!
//! Disposal is idempotent and total: hooks run in insertion order with
//! errors swallowed, the isolate is torn down (timers cancelled, in-flight
//! calls rejected), `is_disposed` flips, and the dispose signal fires
//! exactly once. The watchdog, the memory-limit path and `dispose()` all
//! funnel through the same sequence.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};

use roomscript_protocol::{ModuleSource, QuotaConfig, SourceProvider};

use crate::bridge::{BridgedFunction, HostOutcome};
use crate::error::ProgramError;
use crate::inspector::InspectorSession;
use crate::isolate::{self, IsolateOp, IsolateSpawn};
use crate::module::ProgramModule;
use crate::watchdog::{self, ExecMeter};

/// Engine heap statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocated_bytes: i64,
    pub used_bytes: i64,
    pub limit_bytes: i64,
}

/// RPC wiring configuration. The module names are guest-facing builtins;
/// both are members of the privileged set from construction. The binding
/// helper source may be overridden by the host.
#[derive(Clone)]
pub struct RpcOptions {
    pub rpc_module: String,
    pub room_module: String,
    pub bind_source: Option<Arc<dyn Fn(&str, &str) -> String + Send + Sync>>,
}

impl RpcOptions {
    pub(crate) fn render_bind(&self, user_module: &str) -> String {
        if let Some(custom) = &self.bind_source {
            return custom(user_module, &self.rpc_module);
        }
        format!(
            "import * as form from \"{user_module}\";\n\
             import {{ bind }} from \"{rpc}\";\n\
             export const session = bind(form);\n",
            rpc = self.rpc_module,
        )
    }
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            rpc_module: "room:rpc".to_string(),
            room_module: "room:room".to_string(),
            bind_source: None,
        }
    }
}

impl std::fmt::Debug for RpcOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcOptions")
            .field("rpc_module", &self.rpc_module)
            .field("room_module", &self.room_module)
            .field("bind_source", &self.bind_source.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Construction options for a program.
#[derive(Debug, Clone)]
pub struct ProgramOptions {
    /// Hard heap cap for the whole isolate (both contexts share it).
    pub memory_limit_mb: usize,
    /// Whether inspector sessions may be created.
    pub inspector: bool,
    pub quota: QuotaConfig,
    pub rpc: RpcOptions,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            memory_limit_mb: 8,
            inspector: false,
            quota: QuotaConfig::default(),
            rpc: RpcOptions::default(),
        }
    }
}

/// Registration receipt for a dispose hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(pub(crate) u64);

/// State shared between the host handle, the isolate thread and the
/// watchdog. Only primitives live here so every side can observe them
/// without cooperation.
pub(crate) struct ProgramShared {
    kill: AtomicBool,
    disposed: AtomicBool,
    pub meter: Arc<ExecMeter>,
    dispose_requested: Notify,
}

impl ProgramShared {
    fn new() -> Self {
        Self {
            kill: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            meter: Arc::new(ExecMeter::new()),
            dispose_requested: Notify::new(),
        }
    }

    pub fn is_killed(&self) -> bool {
        self.kill.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Ask the host side to run the dispose sequence (memory-limit path).
    pub fn request_dispose(&self) {
        self.dispose_requested.notify_one();
    }
}

pub(crate) struct ProgramInner {
    op_tx: Mutex<Sender<IsolateOp>>,
    pub shared: Arc<ProgramShared>,
    pub options: ProgramOptions,
    hooks: Mutex<Vec<(u64, Box<dyn FnOnce() + Send>)>>,
    next_hook: AtomicU64,
    disposing: AtomicBool,
    dispose_tx: watch::Sender<bool>,
    modules: Mutex<HashMap<String, ProgramModule>>,
}

impl ProgramInner {
    pub fn send(&self, op: IsolateOp) -> Result<(), ProgramError> {
        let tx = match self.op_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        tx.send(op).map_err(|_| ProgramError::IsolateDisposed)
    }

    pub fn add_dispose_hook(&self, hook: Box<dyn FnOnce() + Send>) -> u64 {
        if self.shared.is_disposed() {
            // Late registration: the teardown already happened, run now.
            hook();
            return 0;
        }
        let id = self.next_hook.fetch_add(1, Ordering::SeqCst);
        match self.hooks.lock() {
            Ok(mut hooks) => hooks.push((id, hook)),
            Err(poisoned) => poisoned.into_inner().push((id, hook)),
        }
        id
    }

    pub fn remove_dispose_hook(&self, id: u64) {
        let mut hooks = match self.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        hooks.retain(|(hook_id, _)| *hook_id != id);
    }

    /// The one dispose sequence. Safe to call from any thread, runs once.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        // Abort any running guest stack before anything else.
        self.shared.kill.store(true, Ordering::SeqCst);

        let hooks = match self.hooks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (id, hook) in hooks {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::warn!(target: "roomscript", hook = id, "dispose hook panicked");
            }
        }

        let _ = self.send(IsolateOp::Dispose);
        self.shared.disposed.store(true, Ordering::SeqCst);
        let _ = self.dispose_tx.send(true);
        tracing::debug!(target: "roomscript", "program disposed");
    }

    pub async fn request_resolve(
        &self,
        descriptor: String,
        staged: Option<ModuleSource>,
    ) -> Result<crate::graph::ModuleInfo, ProgramError> {
        if self.shared.is_disposed() {
            return Err(ProgramError::IsolateDisposed);
        }
        let (tx, rx) = oneshot::channel();
        self.send(IsolateOp::Resolve {
            descriptor,
            staged,
            reply: tx,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    fn lookup_module(&self, key: &str) -> Option<ProgramModule> {
        let modules = match self.modules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        modules.get(key).cloned()
    }

    fn register_module(self: &Arc<Self>, info: crate::graph::ModuleInfo) -> ProgramModule {
        let mut modules = match self.modules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = modules.get(&info.canonical).cloned() {
            modules
                .entry(info.descriptor)
                .or_insert_with(|| existing.clone());
            return existing;
        }
        let module = ProgramModule::new(
            info.descriptor.clone(),
            info.canonical.clone(),
            info.deps,
            info.kind,
            Arc::downgrade(self),
        );
        modules.insert(info.canonical, module.clone());
        let descriptor = info.descriptor;
        modules.entry(descriptor).or_insert_with(|| module.clone());
        module
    }
}

impl Drop for ProgramInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Host handle over one sandboxed guest environment. Clones share the same
/// program.
#[derive(Clone)]
pub struct Program {
    inner: Arc<ProgramInner>,
}

impl Program {
    /// Create a program over the given source provider.
    ///
    /// Requires a running tokio runtime: host timers, async host functions
    /// and deferred source fetches are driven by it.
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        options: ProgramOptions,
    ) -> Result<Self, ProgramError> {
        let handle = Handle::try_current()
            .map_err(|_| ProgramError::Init("a tokio runtime is required".to_string()))?;
        let shared = Arc::new(ProgramShared::new());

        let (op_tx, ready_rx) = isolate::spawn(IsolateSpawn {
            provider,
            options: options.clone(),
            shared: shared.clone(),
            handle: handle.clone(),
        });
        ready_rx
            .recv()
            .map_err(|_| ProgramError::Init("isolate thread did not start".to_string()))??;

        let (dispose_tx, _) = watch::channel(false);
        let inner = Arc::new(ProgramInner {
            op_tx: Mutex::new(op_tx),
            shared: shared.clone(),
            options,
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            disposing: AtomicBool::new(false),
            dispose_tx,
            modules: Mutex::new(HashMap::new()),
        });

        watchdog::spawn(Arc::downgrade(&inner), inner.options.quota.clone());

        // Memory-limit observations on the isolate thread funnel into the
        // same dispose sequence as everything else.
        let weak = Arc::downgrade(&inner);
        handle.spawn(async move {
            shared.dispose_requested.notified().await;
            if let Some(inner) = weak.upgrade() {
                inner.dispose();
            }
        });

        Ok(Self { inner })
    }

    /// Resolve a module lazily and wrap it once; later calls for the same
    /// name (or an accepted alias) return the same handle.
    pub async fn get_module(&self, name: &str) -> Result<ProgramModule, ProgramError> {
        if let Some(module) = self.inner.lookup_module(name) {
            return Ok(module);
        }
        let info = self.inner.request_resolve(name.to_string(), None).await?;
        Ok(self.inner.register_module(info))
    }

    /// Insert a source under `name` and resolve it. Fails with
    /// `ModuleAlreadyExists` if the name was ever requested or compiled.
    pub async fn create_module(
        &self,
        name: &str,
        code: &str,
        kind: Option<&str>,
    ) -> Result<ProgramModule, ProgramError> {
        let staged = ModuleSource {
            text: code.to_string(),
            hint: kind.map(String::from),
        };
        let info = self
            .inner
            .request_resolve(name.to_string(), Some(staged))
            .await?;
        Ok(self.inner.register_module(info))
    }

    /// Wire a user module as the RPC form: evaluates the binding helper as
    /// a private submodule of the user module. Idempotent per module.
    pub async fn start_rpc(&self, module_name: &str) -> Result<ProgramModule, ProgramError> {
        let user = self.get_module(module_name).await?;
        let bind_name = format!("{}#rpc", user.canonical());
        if let Some(existing) = self.inner.lookup_module(&bind_name) {
            return Ok(existing);
        }
        let source = self.inner.options.rpc.render_bind(user.canonical());
        self.create_module(&bind_name, &source, None).await
    }

    /// Toggle membership in the privileged set that may import other
    /// modules' private (`#`) submodules.
    pub fn set_builtin_module_name(&self, name: &str, on: bool) {
        let _ = self.inner.send(IsolateOp::SetBuiltin {
            name: name.to_string(),
            on,
        });
    }

    /// Open a debug session. Fails unless the program was constructed with
    /// `inspector: true`.
    pub fn create_inspector_session(&self) -> Result<InspectorSession, ProgramError> {
        if !self.inner.options.inspector {
            return Err(ProgramError::InspectorDisabled);
        }
        if self.inner.shared.is_disposed() {
            return Err(ProgramError::IsolateDisposed);
        }
        Ok(InspectorSession::open(&self.inner))
    }

    /// Wrap a host callback for the maybe-async envelope bridge.
    pub fn create_maybe_async_function<F>(&self, func: F) -> BridgedFunction
    where
        F: Fn(Vec<Json>) -> HostOutcome + Send + Sync + 'static,
    {
        BridgedFunction::new(func)
    }

    /// Install a bridged host function as a global of the main context.
    pub async fn bind_host_function(
        &self,
        name: &str,
        function: BridgedFunction,
    ) -> Result<(), ProgramError> {
        if self.inner.shared.is_disposed() {
            return Err(ProgramError::IsolateDisposed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.send(IsolateOp::BindFunction {
            name: name.to_string(),
            func: function.func,
            reply: tx,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Engine heap statistics.
    pub async fn memory_usage(&self) -> Result<MemoryStats, ProgramError> {
        if self.inner.shared.is_disposed() {
            return Err(ProgramError::IsolateDisposed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.send(IsolateOp::MemoryUsage { reply: tx })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shared.is_disposed()
    }

    /// Dispose the program. Idempotent; see the module docs for the order.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Register a teardown hook; hooks run in insertion order and their
    /// panics are swallowed. Registration after disposal runs immediately.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) -> HookId {
        HookId(self.inner.add_dispose_hook(Box::new(hook)))
    }

    pub fn remove_dispose_hook(&self, id: HookId) {
        self.inner.remove_dispose_hook(id.0);
    }

    /// Wait for the dispose signal. Resolves immediately on a disposed
    /// program; the signal fires at most once.
    pub async fn wait_disposed(&self) {
        let mut rx = self.inner.dispose_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
