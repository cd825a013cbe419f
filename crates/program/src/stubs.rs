//! Helper stubs compiled in the safe context
//!
//! Every host operation on guest values (property access, enumeration,
//! method application, construction, the maybe-async envelope wrapper,
//! promise settlement) goes through a function compiled once in the `safe`
//! context. Guest code executes only in `main` and cannot reach these
//! functions or their prototype chain by name resolution, so monkey-patching
//! `Function.prototype.apply`, `Object.getOwnPropertyNames` or `Promise`
//! in the guest realm does not affect the host's view of guest values.

use rquickjs::{Context, Ctx, Function, Persistent};

use crate::error::ProgramError;

/// Unwraps a host-call envelope inside the guest, preserving the difference
/// between a synchronous throw and a rejecting promise. An arrow so the
/// wrapper carries no `.prototype` own property.
const WRAP_ENVELOPE_SRC: &str = r#"(invoke) => (...args) => {
    const r = invoke(...args);
    if (r.isPromise) {
        return r.get().then((s) => {
            if (s.rejected) throw s.value;
            return s.value;
        });
    }
    if (r.isError) throw r.get();
    return r.get();
}"#;

/// Severs a guest-exposed function from its creation realm: with a null
/// [[Prototype]] the guest cannot walk `constructor` back into the safe
/// context's intrinsics.
const DETACH_SRC: &str = "(f) => { Reflect.setPrototypeOf(f, null); return f; }";

const OWN_KEYS_SRC: &str = "(o) => Object.getOwnPropertyNames(o)";

const GET_PROP_SRC: &str = "(o, k) => o[k]";

const TYPE_OF_SRC: &str = "(o, k) => (k in o ? typeof o[k] : undefined)";

const APPLY_SRC: &str = r#"(o, k, t, a) => {
    const f = o[k];
    if (typeof f !== "function") throw new TypeError(String(k) + " is not a function");
    return Reflect.apply(f, t, a);
}"#;

const CONSTRUCT_SRC: &str = r#"(o, k, a) => {
    const c = o[k];
    if (typeof c !== "function") throw new TypeError(String(k) + " is not a constructor");
    return Reflect.construct(c, a);
}"#;

const SETTLE_SRC: &str = "(p, onOk, onErr) => { Promise.resolve(p).then(onOk, onErr); }";

/// The compiled stub set. Functions are persisted so they can be restored
/// into the `main` guard whenever the host needs them.
pub(crate) struct SafeStubs {
    pub wrap_envelope: Persistent<Function<'static>>,
    pub own_keys: Persistent<Function<'static>>,
    pub get_prop: Persistent<Function<'static>>,
    pub type_of: Persistent<Function<'static>>,
    pub apply: Persistent<Function<'static>>,
    pub construct: Persistent<Function<'static>>,
    pub settle: Persistent<Function<'static>>,
    pub detach: Persistent<Function<'static>>,
}

impl SafeStubs {
    pub fn compile(safe: &Context) -> Result<Self, ProgramError> {
        safe.with(|ctx| {
            Ok(Self {
                wrap_envelope: compile_one(&ctx, WRAP_ENVELOPE_SRC)?,
                own_keys: compile_one(&ctx, OWN_KEYS_SRC)?,
                get_prop: compile_one(&ctx, GET_PROP_SRC)?,
                type_of: compile_one(&ctx, TYPE_OF_SRC)?,
                apply: compile_one(&ctx, APPLY_SRC)?,
                construct: compile_one(&ctx, CONSTRUCT_SRC)?,
                settle: compile_one(&ctx, SETTLE_SRC)?,
                detach: compile_one(&ctx, DETACH_SRC)?,
            })
        })
    }

    /// Restore a stub into the given (main) guard.
    pub fn restore<'js>(
        stub: &Persistent<Function<'static>>,
        ctx: &Ctx<'js>,
    ) -> rquickjs::Result<Function<'js>> {
        stub.clone().restore(ctx)
    }
}

fn compile_one(
    ctx: &Ctx<'_>,
    source: &str,
) -> Result<Persistent<Function<'static>>, ProgramError> {
    let func: Function = ctx
        .eval(source)
        .map_err(|e| ProgramError::Init(format!("stub compilation failed: {e}")))?;
    Ok(Persistent::save(ctx, func))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Object, Runtime, Value};

    #[test]
    fn stubs_compile_in_a_fresh_context() {
        let rt = Runtime::new().unwrap();
        let safe = Context::full(&rt).unwrap();
        SafeStubs::compile(&safe).unwrap();
    }

    #[test]
    fn detached_functions_do_not_leak_their_realm() {
        let rt = Runtime::new().unwrap();
        let main = Context::full(&rt).unwrap();
        let safe = Context::full(&rt).unwrap();
        let stubs = SafeStubs::compile(&safe).unwrap();

        let exposed = safe.with(|ctx| {
            let f: Function = ctx.eval("() => 1").unwrap();
            let detach = SafeStubs::restore(&stubs.detach, &ctx).unwrap();
            let f: Function = detach.call((f,)).unwrap();
            rquickjs::Persistent::save(&ctx, f)
        });

        main.with(|ctx| {
            let f = exposed.restore(&ctx).unwrap();
            let check: Function = ctx
                .eval("(f) => Object.getPrototypeOf(f) === null")
                .unwrap();
            let severed: bool = check.call((f,)).unwrap();
            assert!(severed, "exposed function still reaches its realm");
        });
    }

    #[test]
    fn stubs_survive_guest_prototype_tampering() {
        let rt = Runtime::new().unwrap();
        let main = Context::full(&rt).unwrap();
        let safe = Context::full(&rt).unwrap();
        let stubs = SafeStubs::compile(&safe).unwrap();

        main.with(|ctx| {
            // Guest sabotages its own reflection primitives.
            ctx.eval::<(), _>(
                "Object.getOwnPropertyNames = () => { throw new Error('gotcha') };
                 Function.prototype.apply = () => { throw new Error('gotcha') };",
            )
            .unwrap();

            let target = Object::new(ctx.clone()).unwrap();
            target.set("x", 1).unwrap();

            let own_keys = SafeStubs::restore(&stubs.own_keys, &ctx).unwrap();
            let keys: Vec<String> = own_keys.call((target.clone(),)).unwrap();
            assert_eq!(keys, vec!["x".to_string()]);

            let type_of = SafeStubs::restore(&stubs.type_of, &ctx).unwrap();
            let t: String = type_of.call((target.clone(), "x")).unwrap();
            assert_eq!(t, "number");
            let missing: Value = type_of.call((target, "y")).unwrap();
            assert!(missing.is_undefined());
        });
    }
}
