//! Isolate thread
//!
//! The engine runtime and both contexts live on one dedicated OS thread.
//! Host-facing methods, host timer tasks and async host-call completions all
//! post messages here; the thread processes them one at a time and drains
//! the engine's job queue after each, so host callbacks serialize against
//! guest execution exactly as the concurrency model promises.
//!
//! Replies that depend on a guest promise (method results, module
//! evaluation) are parked in a slot table and sent when the promise settles;
//! the thread keeps processing messages in the meantime, so timers can fire
//! while a top-level-await module is still evaluating.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use rquickjs::{Array, Context, Ctx, Function, Object, Persistent, Runtime, Value};
use serde_json::Value as Json;
use tokio::runtime::Handle;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use roomscript_protocol::{ModuleSource, SourceProvider};

use crate::bridge::{self, HostFunction};
use crate::error::ProgramError;
use crate::graph::{
    classify_module_error, import_module, EntrySnapshot, GraphCell, GraphLoader, GraphResolver,
    GraphState, ModuleInfo,
};
use crate::inspector::{self, InspectorEvent};
use crate::program::{MemoryStats, ProgramOptions, ProgramShared};
use crate::stubs::SafeStubs;
use crate::timers::{self, TimerCell, TimerKind, TimerRegistry};
use crate::value::{js_to_json, json_to_js};

/// Messages processed by the isolate thread.
pub(crate) enum IsolateOp {
    Resolve {
        descriptor: String,
        staged: Option<ModuleSource>,
        reply: oneshot::Sender<Result<ModuleInfo, ProgramError>>,
    },
    GetType {
        module: String,
        prop: String,
        reply: Sender<Result<Option<String>, ProgramError>>,
    },
    GetKeys {
        module: String,
        reply: oneshot::Sender<Result<Vec<String>, ProgramError>>,
    },
    GetProp {
        module: String,
        prop: String,
        reply: oneshot::Sender<Result<Json, ProgramError>>,
    },
    Call {
        module: String,
        prop: String,
        this: Option<Json>,
        args: Vec<Json>,
        /// `None` is fire-and-forget: errors are swallowed.
        reply: Option<oneshot::Sender<Result<Json, ProgramError>>>,
    },
    Construct {
        module: String,
        prop: String,
        args: Vec<Json>,
        reply: oneshot::Sender<Result<Json, ProgramError>>,
    },
    BindFunction {
        name: String,
        func: HostFunction,
        reply: oneshot::Sender<Result<(), ProgramError>>,
    },
    SetBuiltin {
        name: String,
        on: bool,
    },
    TimerFired {
        kind: TimerKind,
        id: u64,
    },
    AsyncComplete {
        token: u64,
        outcome: Result<Json, Json>,
    },
    Inspector {
        message: Json,
        events: UnboundedSender<InspectorEvent>,
    },
    MemoryUsage {
        reply: oneshot::Sender<MemoryStats>,
    },
    Dispose,
}

/// A parked continuation waiting on a guest promise or a host future.
pub(crate) enum Slot {
    Call {
        reply: oneshot::Sender<Result<Json, ProgramError>>,
    },
    Ignored {
        module: String,
        prop: String,
    },
    Module {
        descriptor: String,
        canonical: String,
        reply: oneshot::Sender<Result<ModuleInfo, ProgramError>>,
    },
    HostPromise {
        resolve: Option<Persistent<Function<'static>>>,
    },
}

pub(crate) type SlotCell = Rc<RefCell<SlotTable>>;

#[derive(Default)]
pub(crate) struct SlotTable {
    next: u64,
    slots: HashMap<u64, Slot>,
}

impl SlotTable {
    pub fn insert(&mut self, slot: Slot) -> u64 {
        self.next += 1;
        let token = self.next;
        self.slots.insert(token, slot);
        token
    }

    pub fn remove(&mut self, token: u64) -> Option<Slot> {
        self.slots.remove(&token)
    }

    pub fn get_mut(&mut self, token: u64) -> Option<&mut Slot> {
        self.slots.get_mut(&token)
    }

    pub fn module_canonical(&self, token: u64) -> Option<String> {
        match self.slots.get(&token) {
            Some(Slot::Module { canonical, .. }) => Some(canonical.clone()),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<(u64, Slot)> {
        self.slots.drain().collect()
    }
}

pub(crate) struct IsolateSpawn {
    pub provider: Arc<dyn SourceProvider>,
    pub options: ProgramOptions,
    pub shared: Arc<ProgramShared>,
    pub handle: Handle,
}

/// Spawn the isolate thread. The second return is the bootstrap outcome:
/// engine/context/stub creation errors surface from `Program::new`.
pub(crate) fn spawn(
    cfg: IsolateSpawn,
) -> (
    Sender<IsolateOp>,
    std::sync::mpsc::Receiver<Result<(), ProgramError>>,
) {
    let (op_tx, op_rx) = std::sync::mpsc::channel();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let thread_tx = op_tx.clone();
    let spawned = std::thread::Builder::new()
        .name("roomscript-isolate".to_string())
        .spawn(move || match IsolateState::create(cfg, thread_tx) {
            Ok(mut state) => {
                let _ = ready_tx.send(Ok(()));
                state.run(op_rx);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });
    if let Err(e) = spawned {
        tracing::error!(target: "roomscript", error = %e, "failed to spawn isolate thread");
    }
    (op_tx, ready_rx)
}

struct IsolateState {
    // Declaration order doubles as drop order: everything holding engine
    // references must go before the contexts and the runtime.
    stubs: SafeStubs,
    graph: GraphCell,
    slots: SlotCell,
    timers: TimerCell,
    provider: Arc<dyn SourceProvider>,
    shared: Arc<ProgramShared>,
    handle: Handle,
    op_tx: Sender<IsolateOp>,
    limit_bytes: usize,
    saw_engine_error: Cell<bool>,
    cleaned: bool,
    main: Context,
    safe: Context,
    runtime: Runtime,
}

impl IsolateState {
    fn create(cfg: IsolateSpawn, op_tx: Sender<IsolateOp>) -> Result<Self, ProgramError> {
        let init = |e: rquickjs::Error| ProgramError::Init(e.to_string());

        let runtime = Runtime::new().map_err(init)?;
        let limit_bytes = cfg.options.memory_limit_mb * 1024 * 1024;
        runtime.set_memory_limit(limit_bytes);

        let shared = cfg.shared.clone();
        let kill = shared.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || kill.is_killed())));

        let main = Context::full(&runtime).map_err(init)?;
        let safe = Context::full(&runtime).map_err(init)?;
        let stubs = SafeStubs::compile(&safe)?;

        let state = Self {
            stubs,
            graph: Rc::new(RefCell::new(GraphState::default())),
            slots: Rc::new(RefCell::new(SlotTable::default())),
            timers: Rc::new(RefCell::new(TimerRegistry::default())),
            provider: cfg.provider,
            shared,
            handle: cfg.handle,
            op_tx,
            limit_bytes,
            saw_engine_error: Cell::new(false),
            cleaned: false,
            main,
            safe,
            runtime,
        };

        timers::install(
            &state.main,
            &state.safe,
            &state.stubs,
            state.timers.clone(),
            state.op_tx.clone(),
            state.handle.clone(),
        )?;
        install_console(&state.main, &state.safe, &state.stubs)?;

        {
            let mut g = state.graph.borrow_mut();
            g.set_builtin(&cfg.options.rpc.rpc_module, true);
            g.set_builtin(&cfg.options.rpc.room_module, true);
        }

        state.runtime.set_loader(
            GraphResolver {
                graph: state.graph.clone(),
                provider: state.provider.clone(),
            },
            GraphLoader {
                graph: state.graph.clone(),
                provider: state.provider.clone(),
                handle: state.handle.clone(),
                meter: state.shared.meter.clone(),
            },
        );

        Ok(state)
    }

    fn run(&mut self, rx: Receiver<IsolateOp>) {
        loop {
            let Ok(op) = rx.recv() else { break };
            if matches!(op, IsolateOp::Dispose) {
                break;
            }
            self.handle_op(op);
            self.drain_jobs();
            if self.saw_engine_error.take() && self.memory_exceeded() {
                tracing::warn!(
                    target: "roomscript",
                    limit_bytes = self.limit_bytes,
                    "guest heap exceeded its limit; requesting dispose"
                );
                self.shared.request_dispose();
            }
        }
        self.cleanup();
    }

    fn handle_op(&mut self, op: IsolateOp) {
        let dead = self.shared.is_disposed() || self.shared.is_killed();
        match op {
            IsolateOp::Resolve {
                descriptor,
                staged,
                reply,
            } => {
                if dead {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    return;
                }
                self.handle_resolve(descriptor, staged, reply);
            }
            IsolateOp::GetType {
                module,
                prop,
                reply,
            } => {
                if dead {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    return;
                }
                let _ = reply.send(self.handle_get_type(&module, &prop));
            }
            IsolateOp::GetKeys { module, reply } => {
                if dead {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    return;
                }
                let _ = reply.send(self.handle_get_keys(&module));
            }
            IsolateOp::GetProp {
                module,
                prop,
                reply,
            } => {
                if dead {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    return;
                }
                let _ = reply.send(self.handle_get_prop(&module, &prop));
            }
            IsolateOp::Call {
                module,
                prop,
                this,
                args,
                reply,
            } => {
                if dead {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    }
                    return;
                }
                self.handle_call(module, prop, this, args, reply);
            }
            IsolateOp::Construct {
                module,
                prop,
                args,
                reply,
            } => {
                if dead {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    return;
                }
                let _ = reply.send(self.handle_construct(&module, &prop, &args));
            }
            IsolateOp::BindFunction { name, func, reply } => {
                if dead {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                    return;
                }
                let result = self
                    .main
                    .with(|ctx| {
                        bridge::install_host_function(
                            &ctx,
                            &self.stubs,
                            &self.slots,
                            &self.op_tx,
                            &self.handle,
                            &name,
                            func,
                        )
                    })
                    .map_err(bridge::bind_error);
                let _ = reply.send(result);
            }
            IsolateOp::SetBuiltin { name, on } => {
                self.graph.borrow_mut().set_builtin(&name, on);
            }
            IsolateOp::TimerFired { kind, id } => {
                if dead {
                    return;
                }
                self.handle_fire(kind, id);
            }
            IsolateOp::AsyncComplete { token, outcome } => {
                if dead {
                    self.slots.borrow_mut().remove(token);
                    return;
                }
                self.handle_async_complete(token, outcome);
            }
            IsolateOp::Inspector { message, events } => {
                if dead {
                    return;
                }
                inspector::handle_backend(&self.main, &self.shared, &message, &events);
            }
            IsolateOp::MemoryUsage { reply } => {
                let usage = self.runtime.memory_usage();
                let _ = reply.send(MemoryStats {
                    allocated_bytes: usage.malloc_size,
                    used_bytes: usage.memory_used_size,
                    limit_bytes: usage.malloc_limit,
                });
            }
            IsolateOp::Dispose => {}
        }
    }

    // === modules ===

    fn handle_resolve(
        &mut self,
        descriptor: String,
        staged: Option<ModuleSource>,
        reply: oneshot::Sender<Result<ModuleInfo, ProgramError>>,
    ) {
        let canonical = {
            let mut g = self.graph.borrow_mut();
            // Stale stash from an earlier guest-handled import failure.
            g.take_error();

            if let Some(source) = staged {
                if let Err(e) = g.stage_created(&descriptor, source) {
                    let _ = reply.send(Err(e));
                    return;
                }
            }

            let snapshot = match g.snapshot(&descriptor) {
                Some(snapshot) => Some(snapshot),
                None => match g.canonicalize(self.provider.as_ref(), &descriptor, None) {
                    // The canonical name may hit an already-concluded record.
                    Ok(canonical) => g.snapshot(&canonical),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                },
            };
            match snapshot {
                Some(EntrySnapshot::Failed(e)) => {
                    let _ = reply.send(Err(e));
                    return;
                }
                Some(EntrySnapshot::Ready(info)) => {
                    let _ = reply.send(Ok(ModuleInfo { descriptor, ..info }));
                    return;
                }
                Some(EntrySnapshot::Pending { canonical }) => canonical,
                None => {
                    // canonicalize() always creates the entry it names.
                    let _ = reply.send(Err(ProgramError::UnknownReferrer(descriptor)));
                    return;
                }
            }
        };

        tracing::debug!(target: "roomscript::graph", descriptor, canonical, "resolving module");
        let token = self.slots.borrow_mut().insert(Slot::Module {
            descriptor,
            canonical: canonical.clone(),
            reply,
        });

        let started: Result<(), ProgramError> = self.main.with(|ctx| {
            let run = || -> rquickjs::Result<()> {
                let promise = {
                    let _busy = self.shared.meter.enter();
                    import_module(&ctx, &canonical)?
                };
                self.park_module(&ctx, promise, token)
            };
            run().map_err(|e| {
                let detail = caught_to_json(&ctx, e);
                self.graph
                    .borrow_mut()
                    .take_error()
                    .unwrap_or_else(|| ProgramError::Compile {
                        module: canonical.clone(),
                        message: detail.to_string(),
                    })
            })
        });

        if let Err(typed) = started {
            complete_module_err(&self.graph, &self.slots, token, typed);
        }
    }

    fn handle_get_type(&self, module: &str, prop: &str) -> Result<Option<String>, ProgramError> {
        let ns = self.graph.borrow().namespace(module)?;
        self.main.with(|ctx| {
            let run = || -> rquickjs::Result<Option<String>> {
                let ns = ns.restore(&ctx)?;
                let type_of = SafeStubs::restore(&self.stubs.type_of, &ctx)?;
                let tag: Value = type_of.call((ns, prop))?;
                if tag.is_undefined() {
                    return Ok(None);
                }
                match tag.as_string() {
                    Some(s) => Ok(Some(s.to_string()?)),
                    None => Ok(None),
                }
            };
            run().map_err(|e| self.reflection_error(&ctx, module, e))
        })
    }

    fn handle_get_keys(&self, module: &str) -> Result<Vec<String>, ProgramError> {
        let ns = self.graph.borrow().namespace(module)?;
        self.main.with(|ctx| {
            let run = || -> rquickjs::Result<Vec<String>> {
                let ns = ns.restore(&ctx)?;
                let own_keys = SafeStubs::restore(&self.stubs.own_keys, &ctx)?;
                own_keys.call((ns,))
            };
            run().map_err(|e| self.reflection_error(&ctx, module, e))
        })
    }

    fn handle_get_prop(&self, module: &str, prop: &str) -> Result<Json, ProgramError> {
        let ns = self.graph.borrow().namespace(module)?;
        self.main
            .with(|ctx| -> Result<Json, ProgramError> {
                let run = || -> rquickjs::Result<Json> {
                    let ns = ns.restore(&ctx)?;
                    let get_prop = SafeStubs::restore(&self.stubs.get_prop, &ctx)?;
                    let value: Value = get_prop.call((ns, prop))?;
                    js_to_json(&ctx, &value)
                };
                run().map_err(|e| self.map_call_error(&ctx, module, e))
            })
    }

    fn handle_construct(
        &self,
        module: &str,
        prop: &str,
        args: &[Json],
    ) -> Result<Json, ProgramError> {
        let ns = self.graph.borrow().namespace(module)?;
        self.main.with(|ctx| -> Result<Json, ProgramError> {
            let run = || -> rquickjs::Result<Json> {
                let ns = ns.restore(&ctx)?;
                let construct = SafeStubs::restore(&self.stubs.construct, &ctx)?;
                let js_args = copy_args(&ctx, args)?;
                let value: Value = {
                    let _busy = self.shared.meter.enter();
                    construct.call((ns, prop, js_args))?
                };
                js_to_json(&ctx, &value)
            };
            run().map_err(|e| self.map_call_error(&ctx, module, e))
        })
    }

    fn handle_call(
        &mut self,
        module: String,
        prop: String,
        this: Option<Json>,
        args: Vec<Json>,
        reply: Option<oneshot::Sender<Result<Json, ProgramError>>>,
    ) {
        let ns = match self.graph.borrow().namespace(&module) {
            Ok(ns) => ns,
            Err(e) => {
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(e));
                    }
                    None => tracing::debug!(
                        target: "roomscript",
                        module, prop, error = %e,
                        "ignored call hit unusable module"
                    ),
                }
                return;
            }
        };

        let token = self.slots.borrow_mut().insert(match reply {
            Some(reply) => Slot::Call { reply },
            None => Slot::Ignored {
                module: module.clone(),
                prop: prop.clone(),
            },
        });

        let outcome: Result<(), ProgramError> = self.main.with(|ctx| {
            let run = || -> rquickjs::Result<Value> {
                let ns = ns.restore(&ctx)?;
                let apply = SafeStubs::restore(&self.stubs.apply, &ctx)?;
                let this_value = match &this {
                    // A truthy `this` is copied in; a falsy one passes through.
                    Some(j) if json_truthy(j) => json_to_js(&ctx, j)?,
                    _ => Value::new_undefined(ctx.clone()),
                };
                let js_args = copy_args(&ctx, &args)?;
                let _busy = self.shared.meter.enter();
                apply.call((ns, prop.as_str(), this_value, js_args))
            };
            match run() {
                // Every result is routed through the settle stub: plain
                // values resolve on the next microtask, promises when the
                // guest settles them.
                Ok(value) => self
                    .park_clone(&ctx, value, token)
                    .map_err(|e| self.map_call_error(&ctx, &module, e)),
                Err(e) => Err(self.map_call_error(&ctx, &module, e)),
            }
        });

        if let Err(error) = outcome {
            complete_clone_slot(&self.slots, token, Err(error));
        }
    }

    // === parked continuations ===

    /// Route a guest value through the settle stub and complete a
    /// clone-reply slot with the structured-cloned result.
    fn park_clone<'a>(&self, ctx: &Ctx<'a>, value: Value<'a>, token: u64) -> rquickjs::Result<()> {
        let on_ok = Function::new(ctx.clone(), {
            let slots = self.slots.clone();
            let shared = self.shared.clone();
            move |ctx: Ctx<'a>, v: Value<'a>| -> rquickjs::Result<()> {
                let outcome = if shared.is_killed() {
                    Err(ProgramError::IsolateDisposed)
                } else {
                    match js_to_json(&ctx, &v) {
                        Ok(json) => Ok(json),
                        Err(e) => Err(ProgramError::Guest(caught_to_json(&ctx, e))),
                    }
                };
                complete_clone_slot(&slots, token, outcome);
                Ok(())
            }
        })?;
        let on_err = Function::new(ctx.clone(), {
            let slots = self.slots.clone();
            let shared = self.shared.clone();
            move |ctx: Ctx<'a>, v: Value<'a>| -> rquickjs::Result<()> {
                let outcome = if shared.is_killed() {
                    Err(ProgramError::IsolateDisposed)
                } else {
                    Err(ProgramError::Guest(
                        js_to_json(&ctx, &v).unwrap_or(Json::Null),
                    ))
                };
                complete_clone_slot(&slots, token, outcome);
                Ok(())
            }
        })?;
        let settle = SafeStubs::restore(&self.stubs.settle, ctx)?;
        settle.call::<_, ()>((value, on_ok, on_err))
    }

    /// Route a module evaluation promise through the settle stub; fulfilment
    /// stores the namespace, rejection concludes the record with the typed
    /// error stashed by the resolver/loader.
    fn park_module<'a>(&self, ctx: &Ctx<'a>, promise: Value<'a>, token: u64) -> rquickjs::Result<()> {
        let on_ok = Function::new(ctx.clone(), {
            let graph = self.graph.clone();
            let slots = self.slots.clone();
            move |ctx: Ctx<'a>, ns: Object<'a>| -> rquickjs::Result<()> {
                let namespace = Persistent::save(&ctx, ns);
                complete_module_ok(&graph, &slots, token, namespace);
                Ok(())
            }
        })?;
        let on_err = Function::new(ctx.clone(), {
            let graph = self.graph.clone();
            let slots = self.slots.clone();
            let shared = self.shared.clone();
            move |ctx: Ctx<'a>, v: Value<'a>| -> rquickjs::Result<()> {
                let typed = if shared.is_killed() {
                    ProgramError::IsolateDisposed
                } else {
                    let canonical = slots
                        .borrow()
                        .module_canonical(token)
                        .unwrap_or_default();
                    graph
                        .borrow_mut()
                        .take_error()
                        .unwrap_or_else(|| classify_module_error(&ctx, &canonical, &v, false))
                };
                complete_module_err(&graph, &slots, token, typed);
                Ok(())
            }
        })?;
        let settle = SafeStubs::restore(&self.stubs.settle, ctx)?;
        settle.call::<_, ()>((promise, on_ok, on_err))
    }

    // === timers, async completions ===

    fn handle_fire(&self, kind: TimerKind, id: u64) {
        let Some(callback) = self.timers.borrow_mut().on_fire(kind, id) else {
            return;
        };
        let failure: Option<Json> = self.main.with(|ctx| {
            let run = || -> rquickjs::Result<()> {
                let callback = callback.restore(&ctx)?;
                let _busy = self.shared.meter.enter();
                callback.call::<_, ()>(())
            };
            run().err().map(|e| caught_to_json(&ctx, e))
        });
        if let Some(detail) = failure {
            tracing::warn!(target: "guest", ?kind, id, error = %detail, "timer callback raised");
        }
    }

    fn handle_async_complete(&self, token: u64, outcome: Result<Json, Json>) {
        let resolve = match self.slots.borrow_mut().remove(token) {
            Some(Slot::HostPromise { resolve }) => resolve,
            _ => return,
        };
        let Some(resolve) = resolve else {
            return;
        };
        let failure: Option<Json> = self.main.with(|ctx| {
            let run = || -> rquickjs::Result<()> {
                let _busy = self.shared.meter.enter();
                bridge::complete_async_call(&ctx, resolve, outcome)
            };
            run().err().map(|e| caught_to_json(&ctx, e))
        });
        if let Some(detail) = failure {
            tracing::warn!(target: "roomscript", token, error = %detail, "async completion failed");
        }
    }

    // === plumbing ===

    fn drain_jobs(&self) {
        let _busy = self.shared.meter.enter();
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => {
                    // The failing job was consumed; later jobs may be fine.
                    tracing::warn!(target: "guest", "unhandled error in guest job");
                }
            }
        }
    }

    fn memory_exceeded(&self) -> bool {
        self.runtime.memory_usage().malloc_size >= self.limit_bytes as i64
    }

    fn map_call_error(&self, ctx: &Ctx<'_>, module: &str, e: rquickjs::Error) -> ProgramError {
        if self.shared.is_killed() {
            return ProgramError::IsolateDisposed;
        }
        self.saw_engine_error.set(true);
        match e {
            rquickjs::Error::Exception => ProgramError::Guest(caught_to_json(ctx, e)),
            other => ProgramError::Evaluate {
                module: module.to_string(),
                message: other.to_string(),
            },
        }
    }

    fn reflection_error(&self, ctx: &Ctx<'_>, module: &str, e: rquickjs::Error) -> ProgramError {
        if self.shared.is_killed() {
            return ProgramError::IsolateDisposed;
        }
        ProgramError::Evaluate {
            module: module.to_string(),
            message: caught_to_json(ctx, e).to_string(),
        }
    }

    /// Teardown while the runtime is still alive: cancel timers, reject
    /// parked replies, conclude pending modules, drop engine references.
    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.timers.borrow_mut().clear_all();
        for (_, slot) in self.slots.borrow_mut().drain() {
            match slot {
                Slot::Call { reply } => {
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                }
                Slot::Module {
                    canonical, reply, ..
                } => {
                    self.graph
                        .borrow_mut()
                        .mark_failed(&canonical, ProgramError::IsolateDisposed);
                    let _ = reply.send(Err(ProgramError::IsolateDisposed));
                }
                Slot::Ignored { .. } | Slot::HostPromise { .. } => {}
            }
        }
        self.graph.borrow_mut().clear_engine_refs();
        tracing::debug!(target: "roomscript", "isolate thread torn down");
    }
}

// === slot completion (shared with settle natives) ===

pub(crate) fn complete_clone_slot(
    slots: &SlotCell,
    token: u64,
    outcome: Result<Json, ProgramError>,
) {
    match slots.borrow_mut().remove(token) {
        Some(Slot::Call { reply }) => {
            let _ = reply.send(outcome);
        }
        Some(Slot::Ignored { module, prop }) => {
            if let Err(e) = outcome {
                tracing::debug!(target: "roomscript", module, prop, error = %e, "ignored call failed");
            }
        }
        _ => {}
    }
}

fn complete_module_ok(
    graph: &GraphCell,
    slots: &SlotCell,
    token: u64,
    namespace: Persistent<Object<'static>>,
) {
    let Some(Slot::Module {
        descriptor,
        canonical,
        reply,
    }) = slots.borrow_mut().remove(token)
    else {
        return;
    };
    let (deps, kind) = {
        let mut g = graph.borrow_mut();
        g.mark_evaluated(&canonical, namespace);
        g.record(&canonical)
            .map(|r| (r.deps.clone(), r.kind))
            .unwrap_or((Vec::new(), crate::graph::ModuleKind::Js))
    };
    let _ = reply.send(Ok(ModuleInfo {
        descriptor,
        canonical,
        deps,
        kind,
    }));
}

pub(crate) fn complete_module_err(
    graph: &GraphCell,
    slots: &SlotCell,
    token: u64,
    error: ProgramError,
) {
    let Some(Slot::Module {
        canonical, reply, ..
    }) = slots.borrow_mut().remove(token)
    else {
        return;
    };
    graph.borrow_mut().mark_failed(&canonical, error.clone());
    let _ = reply.send(Err(error));
}

// === helpers ===

fn copy_args<'js>(ctx: &Ctx<'js>, args: &[Json]) -> rquickjs::Result<Array<'js>> {
    let out = Array::new(ctx.clone())?;
    for (i, arg) in args.iter().enumerate() {
        out.set(i, json_to_js(ctx, arg)?)?;
    }
    Ok(out)
}

/// The thrown value behind an engine error, structured-cloned. Non-exception
/// errors stringify.
pub(crate) fn caught_to_json(ctx: &Ctx<'_>, e: rquickjs::Error) -> Json {
    if matches!(e, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        js_to_json(ctx, &caught).unwrap_or(Json::Null)
    } else {
        Json::String(e.to_string())
    }
}

fn json_truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

fn install_console(main: &Context, safe: &Context, stubs: &SafeStubs) -> Result<(), ProgramError> {
    let log = safe
        .with(|ctx| -> rquickjs::Result<Persistent<Function<'static>>> {
            let log = Function::new(
                ctx.clone(),
                |ctx: Ctx<'_>, args: rquickjs::function::Rest<Value<'_>>| {
                    let mut parts = Vec::with_capacity(args.len());
                    for arg in args.iter() {
                        if let Some(s) = arg.as_string() {
                            parts.push(s.to_string().unwrap_or_default());
                        } else {
                            let json = js_to_json(&ctx, arg).unwrap_or(Json::Null);
                            parts.push(json.to_string());
                        }
                    }
                    tracing::debug!(target: "guest", message = %parts.join(" "));
                },
            )?;
            let detach = SafeStubs::restore(&stubs.detach, &ctx)?;
            let log: Function = detach.call((log,))?;
            Ok(Persistent::save(&ctx, log))
        })
        .map_err(|e| ProgramError::Init(format!("console installation failed: {e}")))?;

    main.with(|ctx| -> rquickjs::Result<()> {
        let console = Object::new(ctx.clone())?;
        for name in ["log", "info", "warn", "error", "debug"] {
            console.set(name, log.clone().restore(&ctx)?)?;
        }
        ctx.globals().set("console", console)?;
        Ok(())
    })
    .map_err(|e| ProgramError::Init(format!("console installation failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_tokens_are_unique_and_removable() {
        let mut table = SlotTable::default();
        let a = table.insert(Slot::Ignored {
            module: "m".into(),
            prop: "p".into(),
        });
        let b = table.insert(Slot::HostPromise { resolve: None });
        assert_ne!(a, b);
        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert!(matches!(
            table.remove(b),
            Some(Slot::HostPromise { resolve: None })
        ));
    }

    #[test]
    fn json_truthiness_follows_guest_semantics() {
        use serde_json::json;
        assert!(!json_truthy(&json!(null)));
        assert!(!json_truthy(&json!(false)));
        assert!(!json_truthy(&json!(0)));
        assert!(!json_truthy(&json!("")));
        assert!(json_truthy(&json!({})));
        assert!(json_truthy(&json!([])));
        assert!(json_truthy(&json!("x")));
        assert!(json_truthy(&json!(1)));
    }
}
