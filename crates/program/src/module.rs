//! ProgramModule: host handle over an evaluated module namespace

use std::sync::{Arc, Weak};

use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::error::ProgramError;
use crate::graph::ModuleKind;
use crate::isolate::IsolateOp;
use crate::program::ProgramInner;

struct ModuleShared {
    descriptor: String,
    canonical: String,
    deps: Vec<String>,
    kind: ModuleKind,
}

/// Thin handle over a compiled and evaluated module. Handles are deduped by
/// canonical name: every request for the same module (or an accepted alias)
/// yields the same handle, forever.
#[derive(Clone)]
pub struct ProgramModule {
    shared: Arc<ModuleShared>,
    program: Weak<ProgramInner>,
}

impl ProgramModule {
    pub(crate) fn new(
        descriptor: String,
        canonical: String,
        deps: Vec<String>,
        kind: ModuleKind,
        program: Weak<ProgramInner>,
    ) -> Self {
        Self {
            shared: Arc::new(ModuleShared {
                descriptor,
                canonical,
                deps,
                kind,
            }),
            program,
        }
    }

    /// The descriptor this handle was first requested under.
    pub fn descriptor(&self) -> &str {
        &self.shared.descriptor
    }

    /// The module's canonical name.
    pub fn canonical(&self) -> &str {
        &self.shared.canonical
    }

    /// How the module's source was interpreted (JS or JSON).
    pub fn kind(&self) -> ModuleKind {
        self.shared.kind
    }

    /// Whether two handles refer to the same graph entry.
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Raw import specifiers of this module, in source order, as recorded
    /// when the module was compiled.
    pub fn get_dependency_specifiers(&self) -> Vec<String> {
        self.shared.deps.clone()
    }

    /// Engine-reported `typeof` tag of an export, or `None` if absent.
    ///
    /// Synchronous: blocks the caller briefly while the isolate thread
    /// answers. Prefer the async accessors on hot paths.
    pub fn get_type(&self, prop: &str) -> Result<Option<String>, ProgramError> {
        let program = self.program()?;
        let (tx, rx) = std::sync::mpsc::channel();
        program.send(IsolateOp::GetType {
            module: self.shared.canonical.clone(),
            prop: prop.to_string(),
            reply: tx,
        })?;
        rx.recv().map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Own property names of the namespace.
    pub async fn get_keys(&self) -> Result<Vec<String>, ProgramError> {
        let program = self.program()?;
        let (tx, rx) = oneshot::channel();
        program.send(IsolateOp::GetKeys {
            module: self.shared.canonical.clone(),
            reply: tx,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Structured-clone copy of an exported value.
    pub async fn get_prop(&self, prop: &str) -> Result<Json, ProgramError> {
        let program = self.program()?;
        let (tx, rx) = oneshot::channel();
        program.send(IsolateOp::GetProp {
            module: self.shared.canonical.clone(),
            prop: prop.to_string(),
            reply: tx,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Call an exported function with copied arguments; the result is a
    /// copy, awaited if the guest returned a promise. A truthy `this` is
    /// copied in, a falsy one passes through.
    pub async fn call_method(
        &self,
        prop: &str,
        this: Option<Json>,
        args: Vec<Json>,
    ) -> Result<Json, ProgramError> {
        let program = self.program()?;
        let (tx, rx) = oneshot::channel();
        program.send(IsolateOp::Call {
            module: self.shared.canonical.clone(),
            prop: prop.to_string(),
            this,
            args,
            reply: Some(tx),
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    /// Fire-and-forget call: any error is swallowed, and ordering with
    /// later `call_method` calls is best-effort only. Used for
    /// host-originated event dispatch where guest back-pressure is
    /// undesirable.
    pub fn call_method_ignored(&self, prop: &str, this: Option<Json>, args: Vec<Json>) {
        let Ok(program) = self.program() else {
            return;
        };
        let _ = program.send(IsolateOp::Call {
            module: self.shared.canonical.clone(),
            prop: prop.to_string(),
            this,
            args,
            reply: None,
        });
    }

    /// Construct an exported class with copied arguments; returns a copy of
    /// the instance.
    pub async fn construct(&self, prop: &str, args: Vec<Json>) -> Result<Json, ProgramError> {
        let program = self.program()?;
        let (tx, rx) = oneshot::channel();
        program.send(IsolateOp::Construct {
            module: self.shared.canonical.clone(),
            prop: prop.to_string(),
            args,
            reply: tx,
        })?;
        rx.await.map_err(|_| ProgramError::IsolateDisposed)?
    }

    fn program(&self) -> Result<Arc<ProgramInner>, ProgramError> {
        self.program.upgrade().ok_or(ProgramError::IsolateDisposed)
    }
}

impl std::fmt::Debug for ProgramModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramModule")
            .field("descriptor", &self.shared.descriptor)
            .field("canonical", &self.shared.canonical)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{program_with, provider};
    use serde_json::json;

    const REFLECT_SRC: &str = r#"
        export const name = "mod";
        export const answer = 42;
        export function greet(who) { return "hi " + who }
        export class Box { constructor(v) { this.value = v } }
    "#;

    #[tokio::test]
    async fn get_type_reports_engine_tags() {
        let program = program_with(provider().add("index.js", REFLECT_SRC));
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(module.get_type("name").unwrap().as_deref(), Some("string"));
        assert_eq!(module.get_type("answer").unwrap().as_deref(), Some("number"));
        assert_eq!(module.get_type("greet").unwrap().as_deref(), Some("function"));
        assert_eq!(module.get_type("Box").unwrap().as_deref(), Some("function"));
        assert_eq!(module.get_type("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn get_keys_lists_namespace_exports() {
        let program = program_with(provider().add("index.js", REFLECT_SRC));
        let module = program.get_module("index.js").await.unwrap();
        let mut keys = module.get_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["Box", "answer", "greet", "name"]);
    }

    #[tokio::test]
    async fn get_prop_copies_values() {
        let program = program_with(provider().add("index.js", REFLECT_SRC));
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(module.get_prop("answer").await.unwrap(), json!(42));
        // Functions do not survive the structured clone.
        assert_eq!(module.get_prop("greet").await.unwrap(), json!(null));
        assert_eq!(module.get_prop("missing").await.unwrap(), json!(null));
    }

    #[tokio::test]
    async fn call_method_passes_this_and_args() {
        let program = program_with(provider().add(
            "index.js",
            r#"export function describe(suffix) {
                const who = (this && this.name) ? this.name : "nobody";
                return who + suffix;
            }"#,
        ));
        let module = program.get_module("index.js").await.unwrap();

        let with_this = module
            .call_method("describe", Some(json!({"name": "host"})), vec![json!("!")])
            .await
            .unwrap();
        assert_eq!(with_this, json!("host!"));

        // Falsy `this` passes through instead of being copied in.
        let without = module
            .call_method("describe", None, vec![json!("?")])
            .await
            .unwrap();
        assert_eq!(without, json!("nobody?"));
    }

    #[tokio::test]
    async fn calling_a_non_function_export_is_a_guest_type_error() {
        let program = program_with(provider().add("index.js", REFLECT_SRC));
        let module = program.get_module("index.js").await.unwrap();
        let err = module.call_method("answer", None, vec![]).await.unwrap_err();
        let detail = err.guest_value().expect("guest error").clone();
        assert_eq!(detail["name"], json!("TypeError"));
    }

    #[tokio::test]
    async fn construct_returns_a_copied_instance() {
        let program = program_with(provider().add("index.js", REFLECT_SRC));
        let module = program.get_module("index.js").await.unwrap();
        let instance = module.construct("Box", vec![json!(7)]).await.unwrap();
        assert_eq!(instance, json!({"value": 7}));
    }

    #[tokio::test]
    async fn call_method_ignored_swallows_errors() {
        let program = program_with(provider().add(
            "index.js",
            "let hits = 0;
             export function bump() { hits += 1 }
             export function boom() { throw new Error(\"ignored\") }
             export function hitCount() { return hits }",
        ));
        let module = program.get_module("index.js").await.unwrap();

        module.call_method_ignored("boom", None, vec![]);
        module.call_method_ignored("bump", None, vec![]);
        module.call_method_ignored("missing", None, vec![]);

        // A later awaited call observes the ignored ones already applied.
        let hits = module.call_method("hitCount", None, vec![]).await.unwrap();
        assert_eq!(hits, json!(1));
    }

    #[tokio::test]
    async fn dependency_specifiers_are_recorded_raw() {
        let program = program_with(
            provider()
                .add(
                    "index.js",
                    "import \"./lib/a.js\"; import \"#inner\"; export const x = 1;",
                )
                .add("lib/a.js", "export const a = 1;")
                .add("index.js#inner", "export const i = 1;"),
        );
        let module = program.get_module("index.js").await.unwrap();
        let deps = module.get_dependency_specifiers();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&"./lib/a.js".to_string()));
        assert!(deps.contains(&"#inner".to_string()));

        // Leaves have no dependencies.
        let leaf = program.get_module("lib/a.js").await.unwrap();
        assert!(leaf.get_dependency_specifiers().is_empty());
    }
}
