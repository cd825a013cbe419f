//! Module graph: caching, aliasing and resolution
//!
//! The graph is keyed by both the requested descriptor and the canonical
//! name returned by the `SourceProvider`; two keys may map to one record
//! (aliasing). Records are never recompiled: a failed record replays the
//! same error to every later request, an evaluated record hands out its
//! namespace forever.
//!
//! Specifier rules, applied when a module's imports are resolved against
//! its canonical name:
//! - leading `#`  → private submodule of the referrer (`referrer + spec`);
//! - embedded `#` → another module's private space, builtin referrers only;
//! - otherwise    → relative resolution per the descriptor grammar.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::{Declared, Module};
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use tokio::runtime::Handle;

use roomscript_protocol::{
    crosses_private_boundary, hint_is_json, is_private_specifier, resolve_specifier, ModuleSource,
    SourceFetch, SourceProvider,
};

use crate::error::ProgramError;
use crate::value::js_to_json;
use crate::watchdog::ExecMeter;

/// What a successful resolution reports back to the host.
#[derive(Debug, Clone)]
pub(crate) struct ModuleInfo {
    pub descriptor: String,
    pub canonical: String,
    pub deps: Vec<String>,
    pub kind: ModuleKind,
}

/// How a module's source was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Js,
    Json,
}

pub(crate) enum ModuleState {
    Pending,
    Evaluated(Persistent<Object<'static>>),
    Failed(ProgramError),
}

/// Owned conclusion of a graph entry (see [`GraphState::snapshot`]).
pub(crate) enum EntrySnapshot {
    Failed(ProgramError),
    Ready(ModuleInfo),
    Pending { canonical: String },
}

pub(crate) struct ModuleRecord {
    pub canonical: String,
    pub state: ModuleState,
    pub deps: Vec<String>,
    pub kind: ModuleKind,
}

pub(crate) type GraphCell = Rc<RefCell<GraphState>>;

#[derive(Default)]
pub(crate) struct GraphState {
    /// Descriptor or canonical name → record index. Aliases share an index.
    entries: HashMap<String, usize>,
    records: Vec<ModuleRecord>,
    /// Sources staged by `create_module`, keyed by module name.
    created: HashMap<String, ModuleSource>,
    /// One-shot fetches captured at resolution time, keyed by canonical name.
    pending_fetch: HashMap<String, SourceFetch>,
    /// Modules allowed to import other modules' private submodules.
    builtins: HashSet<String>,
    /// Typed error stashed by the resolver/loader for the failing import.
    pending_error: Option<ProgramError>,
}

impl GraphState {
    pub fn set_builtin(&mut self, name: &str, on: bool) {
        if on {
            self.builtins.insert(name.to_string());
        } else {
            self.builtins.remove(name);
        }
    }

    pub fn stash_error(&mut self, error: ProgramError) {
        // The first error along an import chain is the root cause.
        self.pending_error.get_or_insert(error);
    }

    pub fn take_error(&mut self) -> Option<ProgramError> {
        self.pending_error.take()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn stage_created(&mut self, name: &str, source: ModuleSource) -> Result<(), ProgramError> {
        if self.entries.contains_key(name) || self.created.contains_key(name) {
            return Err(ProgramError::ModuleAlreadyExists(name.to_string()));
        }
        self.created.insert(name.to_string(), source);
        Ok(())
    }

    pub fn record(&self, key: &str) -> Option<&ModuleRecord> {
        self.entries.get(key).map(|&id| &self.records[id])
    }

    /// Owned view of an entry's conclusion, for lookups that must not hold
    /// a borrow across later graph mutation.
    pub fn snapshot(&self, key: &str) -> Option<EntrySnapshot> {
        self.record(key).map(|record| match &record.state {
            ModuleState::Failed(error) => EntrySnapshot::Failed(error.clone()),
            ModuleState::Evaluated(_) => EntrySnapshot::Ready(ModuleInfo {
                descriptor: key.to_string(),
                canonical: record.canonical.clone(),
                deps: record.deps.clone(),
                kind: record.kind,
            }),
            ModuleState::Pending => EntrySnapshot::Pending {
                canonical: record.canonical.clone(),
            },
        })
    }

    fn record_mut(&mut self, key: &str) -> Option<&mut ModuleRecord> {
        let id = *self.entries.get(key)?;
        Some(&mut self.records[id])
    }

    /// Index of the record for `canonical`, creating a pending one if absent.
    pub fn ensure_entry(&mut self, canonical: &str) -> usize {
        if let Some(&id) = self.entries.get(canonical) {
            return id;
        }
        let id = self.records.len();
        self.records.push(ModuleRecord {
            canonical: canonical.to_string(),
            state: ModuleState::Pending,
            deps: Vec::new(),
            kind: ModuleKind::Js,
        });
        self.entries.insert(canonical.to_string(), id);
        id
    }

    pub fn alias(&mut self, descriptor: &str, canonical: &str) {
        if let Some(&id) = self.entries.get(canonical) {
            self.entries.entry(descriptor.to_string()).or_insert(id);
        }
    }

    pub fn mark_evaluated(&mut self, canonical: &str, namespace: Persistent<Object<'static>>) {
        if let Some(record) = self.record_mut(canonical) {
            record.state = ModuleState::Evaluated(namespace);
        }
    }

    pub fn mark_failed(&mut self, canonical: &str, error: ProgramError) {
        if let Some(record) = self.record_mut(canonical) {
            // A concluded record keeps its first outcome.
            if matches!(record.state, ModuleState::Pending) {
                record.state = ModuleState::Failed(error);
            }
        }
    }

    /// Namespace handle of an evaluated module.
    pub fn namespace(&self, canonical: &str) -> Result<Persistent<Object<'static>>, ProgramError> {
        match self.record(canonical).map(|r| &r.state) {
            Some(ModuleState::Evaluated(ns)) => Ok(ns.clone()),
            Some(ModuleState::Failed(e)) => Err(e.clone()),
            Some(ModuleState::Pending) => Err(ProgramError::Evaluate {
                module: canonical.to_string(),
                message: "module has not finished evaluating".to_string(),
            }),
            None => Err(ProgramError::UnknownReferrer(canonical.to_string())),
        }
    }

    /// Resolve an import specifier seen by the engine.
    ///
    /// `base` is the canonical name of the importing module, or an engine
    /// script name for host-driven imports (then `name` must already be a
    /// graph key, placed there by the requesting operation).
    pub fn resolve_import(
        &mut self,
        provider: &dyn SourceProvider,
        base: &str,
        name: &str,
    ) -> Result<String, ProgramError> {
        let Some(&base_id) = self.entries.get(base) else {
            return match self.entries.get(name) {
                Some(&id) => Ok(self.records[id].canonical.clone()),
                None => Err(ProgramError::UnknownReferrer(base.to_string())),
            };
        };

        let base_canonical = self.records[base_id].canonical.clone();

        let resolved = if is_private_specifier(name) {
            format!("{base_canonical}{name}")
        } else if crosses_private_boundary(name) && !self.builtins.contains(&base_canonical) {
            return Err(ProgramError::PrivateModule {
                specifier: name.to_string(),
                referrer: base_canonical,
            });
        } else {
            resolve_specifier(&base_canonical, name)
        };
        let canonical = self.canonicalize(provider, &resolved, Some(&base_canonical))?;
        self.record_dep(base_id, name);
        Ok(canonical)
    }

    /// Record a specifier on its referrer's dependency list. The engine
    /// resolves again for every runtime `import()` of the same specifier, so
    /// each one is kept once, and only after it resolved.
    fn record_dep(&mut self, base_id: usize, name: &str) {
        let deps = &mut self.records[base_id].deps;
        if !deps.iter().any(|dep| dep == name) {
            deps.push(name.to_string());
        }
    }

    /// Map a resolved descriptor to a canonical name, registering the alias
    /// and capturing the provider's fetch for the loader.
    pub fn canonicalize(
        &mut self,
        provider: &dyn SourceProvider,
        resolved: &str,
        from: Option<&str>,
    ) -> Result<String, ProgramError> {
        if let Some(&id) = self.entries.get(resolved) {
            return Ok(self.records[id].canonical.clone());
        }
        if self.created.contains_key(resolved) {
            self.ensure_entry(resolved);
            return Ok(resolved.to_string());
        }
        if let Some(locator) = provider.locate(resolved) {
            let canonical = locator.name;
            self.pending_fetch.insert(canonical.clone(), locator.fetch);
            let id = self.ensure_entry(&canonical);
            self.entries.insert(resolved.to_string(), id);
            return Ok(canonical);
        }
        Err(ProgramError::ModuleNotFound {
            descriptor: resolved.to_string(),
            from: from.map(String::from),
        })
    }

    fn take_fetch(&mut self, canonical: &str) -> Option<SourceFetch> {
        self.pending_fetch.remove(canonical)
    }

    fn created_source(&self, name: &str) -> Option<ModuleSource> {
        self.created.get(name).cloned()
    }

    fn set_kind(&mut self, canonical: &str, kind: ModuleKind) {
        if let Some(record) = self.record_mut(canonical) {
            record.kind = kind;
        }
    }

    /// Drop every engine reference so the runtime can be torn down, and
    /// conclude still-pending records as disposed.
    pub fn clear_engine_refs(&mut self) {
        for record in &mut self.records {
            match record.state {
                ModuleState::Failed(_) => {}
                _ => record.state = ModuleState::Failed(ProgramError::IsolateDisposed),
            }
        }
        self.pending_fetch.clear();
    }
}

/// Resolver plugged into the engine; applies the specifier rules above.
pub(crate) struct GraphResolver {
    pub graph: GraphCell,
    pub provider: Arc<dyn SourceProvider>,
}

impl Resolver for GraphResolver {
    fn resolve(&mut self, ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let outcome = self
            .graph
            .borrow_mut()
            .resolve_import(self.provider.as_ref(), base, name);
        match outcome {
            Ok(canonical) => {
                tracing::trace!(target: "roomscript::graph", base, name, canonical, "resolved import");
                Ok(canonical)
            }
            Err(error) => {
                let message = error.to_string();
                self.graph.borrow_mut().stash_error(error);
                Err(Exception::throw_message(ctx, &message))
            }
        }
    }
}

/// Loader plugged into the engine; fetches, wraps JSON, declares and seeds
/// `import.meta.url` with the canonical name.
pub(crate) struct GraphLoader {
    pub graph: GraphCell,
    pub provider: Arc<dyn SourceProvider>,
    pub handle: Handle,
    pub meter: Arc<ExecMeter>,
}

impl GraphLoader {
    fn take_source(&mut self, name: &str) -> Result<ModuleSource, ProgramError> {
        if let Some(source) = self.graph.borrow().created_source(name) {
            return Ok(source);
        }
        let fetch = match self.graph.borrow_mut().take_fetch(name) {
            Some(fetch) => fetch,
            None => match self.provider.locate(name) {
                Some(locator) => locator.fetch,
                None => {
                    return Err(ProgramError::ModuleNotFound {
                        descriptor: name.to_string(),
                        from: None,
                    })
                }
            },
        };
        match fetch {
            SourceFetch::Ready(source) => Ok(source),
            SourceFetch::Deferred(future) => {
                // Fetch time is host time, not guest CPU time.
                let _pause = self.meter.pause();
                self.handle
                    .block_on(future)
                    .map_err(|message| ProgramError::Compile {
                        module: name.to_string(),
                        message,
                    })
            }
        }
    }

    fn prepare(&self, name: &str, source: ModuleSource) -> Result<(String, ModuleKind), ProgramError> {
        if hint_is_json(source.hint.as_deref()) {
            serde_json::from_str::<serde_json::Value>(&source.text).map_err(|e| {
                ProgramError::Compile {
                    module: name.to_string(),
                    message: format!("invalid JSON module: {e}"),
                }
            })?;
            return Ok((format!("export default {};", source.text), ModuleKind::Json));
        }
        Ok((source.text, ModuleKind::Js))
    }
}

impl Loader for GraphLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = match self.take_source(name) {
            Ok(source) => source,
            Err(error) => {
                let message = error.to_string();
                self.graph.borrow_mut().stash_error(error);
                return Err(Exception::throw_message(ctx, &message));
            }
        };
        let (text, kind) = match self.prepare(name, source) {
            Ok(prepared) => prepared,
            Err(error) => {
                let message = error.to_string();
                self.graph.borrow_mut().stash_error(error);
                return Err(Exception::throw_message(ctx, &message));
            }
        };
        {
            let mut graph = self.graph.borrow_mut();
            graph.ensure_entry(name);
            graph.set_kind(name, kind);
        }
        tracing::debug!(target: "roomscript::graph", module = name, ?kind, "loading module");

        let module = match Module::declare(ctx.clone(), name, text) {
            Ok(module) => module,
            Err(rquickjs::Error::Exception) => {
                let caught = ctx.catch();
                let error = classify_module_error(ctx, name, &caught, true);
                self.graph.borrow_mut().stash_error(error);
                return Err(ctx.throw(caught));
            }
            Err(other) => {
                self.graph.borrow_mut().stash_error(ProgramError::Compile {
                    module: name.to_string(),
                    message: other.to_string(),
                });
                return Err(other);
            }
        };

        let meta: Object = module.meta()?;
        meta.set("url", name)?;
        Ok(module)
    }
}

/// Map a caught engine-level module failure to a typed error.
///
/// Syntax errors are compile failures; link-stage complaints (unresolvable
/// exports, cycles the engine refuses) are instantiate failures; everything
/// else surfaced while running module code is an evaluate failure.
pub(crate) fn classify_module_error(
    ctx: &Ctx<'_>,
    module: &str,
    caught: &Value<'_>,
    compiling: bool,
) -> ProgramError {
    let json = js_to_json(ctx, caught).unwrap_or(serde_json::Value::Null);
    let name = json.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let message = json
        .get("message")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| json.to_string());

    if name == "SyntaxError" {
        let linkish = message.contains("export") || message.contains("circular");
        if linkish && !compiling {
            return ProgramError::Instantiate {
                module: module.to_string(),
                message,
            };
        }
        return ProgramError::Compile {
            module: module.to_string(),
            message,
        };
    }
    ProgramError::Evaluate {
        module: module.to_string(),
        message,
    }
}

/// Fresh trampoline evaluated per host-driven import; `import()` is syntax,
/// so nothing the guest does to its globals can intercept it.
pub(crate) const IMPORT_TRAMPOLINE: &str = "(n) => import(n)";

/// Kick off a host-driven import of `canonical` in the main context and
/// return the (possibly pending) evaluation promise as a value.
pub(crate) fn import_module<'js>(
    ctx: &Ctx<'js>,
    canonical: &str,
) -> rquickjs::Result<Value<'js>> {
    let trampoline: Function = ctx.eval(IMPORT_TRAMPOLINE)?;
    trampoline.call((canonical,))
}
