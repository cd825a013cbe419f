//! Value bridge: maybe-async host functions
//!
//! A bridged host function is wrapped twice. On the host side a native
//! invoke shim copies the guest arguments out, runs the host function and
//! packages the outcome as an envelope `{isError, isPromise, get}`. On the
//! guest side a safe-compiled wrapper unpacks the envelope synchronously:
//! a plain value returns, a sync error throws, a future becomes a guest
//! promise that later settles with `{rejected, value}`. The distinction
//! between a function that throws synchronously and one that returns a
//! rejecting promise survives the boundary in both directions.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Persistent, Promise, Value};
use serde_json::Value as Json;
use tokio::runtime::Handle;

use crate::error::ProgramError;
use crate::isolate::{IsolateOp, Slot, SlotCell};
use crate::stubs::SafeStubs;
use crate::value::{js_to_json, json_to_js};

/// Future form of a host call result. `Err` becomes a rejection whose value
/// reaches the guest verbatim.
pub type HostFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Json, Json>> + Send + 'static>>;

/// Outcome of one host function invocation.
pub enum HostOutcome {
    /// Return the value to the guest.
    Value(Json),
    /// Throw the value in the guest, synchronously.
    Error(Json),
    /// Hand the guest a promise settled by the future.
    Future(HostFuture),
}

impl HostOutcome {
    pub fn future<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<Json, Json>> + Send + 'static,
    {
        Self::Future(Box::pin(future))
    }
}

/// A host callback invocable from guest code.
pub type HostFunction = Arc<dyn Fn(Vec<Json>) -> HostOutcome + Send + Sync>;

/// A host function prepared for the maybe-async envelope wrapper.
#[derive(Clone)]
pub struct BridgedFunction {
    pub(crate) func: HostFunction,
}

impl BridgedFunction {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Vec<Json>) -> HostOutcome + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }
}

impl std::fmt::Debug for BridgedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BridgedFunction(..)")
    }
}

/// Install a bridged function as `name` on the main global.
#[allow(clippy::too_many_arguments)]
pub(crate) fn install_host_function(
    ctx: &Ctx<'_>,
    stubs: &SafeStubs,
    slots: &SlotCell,
    op_tx: &Sender<IsolateOp>,
    handle: &Handle,
    name: &str,
    func: HostFunction,
) -> rquickjs::Result<()> {
    let wrapped = wrap_host_function(ctx, stubs, slots, op_tx, handle, func)?;
    ctx.globals().set(name, wrapped)
}

/// Produce the guest-callable wrapper for a host function.
pub(crate) fn wrap_host_function<'js>(
    ctx: &Ctx<'js>,
    stubs: &SafeStubs,
    slots: &SlotCell,
    op_tx: &Sender<IsolateOp>,
    handle: &Handle,
    func: HostFunction,
) -> rquickjs::Result<Function<'js>> {
    let slots = slots.clone();
    let op_tx = op_tx.clone();
    let handle = handle.clone();

    let invoke = Function::new(ctx.clone(), {
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Object<'js>> {
            let mut copied = Vec::with_capacity(args.len());
            for arg in args.iter() {
                copied.push(js_to_json(&ctx, arg)?);
            }
            let outcome = (func)(copied);
            build_envelope(&ctx, outcome, &slots, &op_tx, &handle)
        }
    })?;

    let wrap = SafeStubs::restore(&stubs.wrap_envelope, ctx)?;
    let wrapped: Function = wrap.call((invoke,))?;
    let detach = SafeStubs::restore(&stubs.detach, ctx)?;
    detach.call((wrapped,))
}

/// Package one host outcome as the `{isError, isPromise, get}` envelope.
fn build_envelope<'js>(
    ctx: &Ctx<'js>,
    outcome: HostOutcome,
    slots: &SlotCell,
    op_tx: &Sender<IsolateOp>,
    handle: &Handle,
) -> rquickjs::Result<Object<'js>> {
    let envelope = Object::new(ctx.clone())?;
    match outcome {
        HostOutcome::Value(value) => {
            envelope.set("isError", false)?;
            envelope.set("isPromise", false)?;
            envelope.set(
                "get",
                Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
                    json_to_js(&ctx, &value)
                })?,
            )?;
        }
        HostOutcome::Error(value) => {
            envelope.set("isError", true)?;
            envelope.set("isPromise", false)?;
            envelope.set(
                "get",
                Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
                    json_to_js(&ctx, &value)
                })?,
            )?;
        }
        HostOutcome::Future(future) => {
            envelope.set("isError", false)?;
            envelope.set("isPromise", true)?;

            let token = slots
                .borrow_mut()
                .insert(Slot::HostPromise { resolve: None });
            let op_tx = op_tx.clone();
            handle.spawn(async move {
                let outcome = future.await;
                let _ = op_tx.send(IsolateOp::AsyncComplete { token, outcome });
            });

            let slots = slots.clone();
            envelope.set(
                "get",
                Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Promise<'js>> {
                    let (promise, resolve, _reject) = Promise::new(&ctx)?;
                    if let Some(Slot::HostPromise { resolve: slot }) =
                        slots.borrow_mut().get_mut(token)
                    {
                        *slot = Some(Persistent::save(&ctx, resolve));
                    }
                    Ok(promise)
                })?,
            )?;
        }
    }
    Ok(envelope)
}

/// Settle the guest promise of an async host call. Rejections are delivered
/// as `{rejected: true, value}`; the safe-side wrapper re-throws the value.
pub(crate) fn complete_async_call(
    ctx: &Ctx<'_>,
    resolve: Persistent<Function<'static>>,
    outcome: Result<Json, Json>,
) -> rquickjs::Result<()> {
    let settlement = Object::new(ctx.clone())?;
    match outcome {
        Ok(value) => {
            settlement.set("rejected", false)?;
            settlement.set("value", json_to_js(ctx, &value)?)?;
        }
        Err(value) => {
            settlement.set("rejected", true)?;
            settlement.set("value", json_to_js(ctx, &value)?)?;
        }
    }
    let resolve = resolve.restore(ctx)?;
    resolve.call::<_, ()>((settlement,))
}

pub(crate) fn bind_error(e: rquickjs::Error) -> ProgramError {
    ProgramError::Init(format!("host function binding failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{program_with, provider};
    use serde_json::json;

    #[tokio::test]
    async fn sync_host_value_returns_synchronously() {
        let program = program_with(provider().add(
            "index.js",
            "export function add() { return hostAdd(1, 2) }",
        ));
        program
            .bind_host_function(
                "hostAdd",
                BridgedFunction::new(|args| {
                    let sum: f64 = args.iter().filter_map(|a| a.as_f64()).sum();
                    HostOutcome::Value(json!(sum))
                }),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(module.call_method("add", None, vec![]).await.unwrap(), json!(3.0));
    }

    #[tokio::test]
    async fn sync_host_error_throws_synchronously() {
        let program = program_with(provider().add(
            "index.js",
            r#"export function check() {
                try { hostFail() } catch (e) { return "sync:" + e }
                return "no-throw";
            }"#,
        ));
        program
            .bind_host_function(
                "hostFail",
                BridgedFunction::new(|_| HostOutcome::Error(json!("boom"))),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("check", None, vec![]).await.unwrap(),
            json!("sync:boom")
        );
    }

    #[tokio::test]
    async fn async_host_value_resolves() {
        let program = program_with(provider().add(
            "index.js",
            "export async function fetchIt() { return await hostFetch(5) }",
        ));
        program
            .bind_host_function(
                "hostFetch",
                BridgedFunction::new(|args| {
                    let n = args.first().and_then(|a| a.as_i64()).unwrap_or(0);
                    HostOutcome::future(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Ok(json!(n + 1))
                    })
                }),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("fetchIt", None, vec![]).await.unwrap(),
            json!(6)
        );
    }

    #[tokio::test]
    async fn async_host_rejection_is_awaited_throw() {
        let program = program_with(provider().add(
            "index.js",
            r#"export async function check() {
                try { await hostReject() } catch (e) { return "async:" + e }
                return "no-throw";
            }"#,
        ));
        program
            .bind_host_function(
                "hostReject",
                BridgedFunction::new(|_| {
                    HostOutcome::future(async { Err(json!("later")) })
                }),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("check", None, vec![]).await.unwrap(),
            json!("async:later")
        );
    }

    #[tokio::test]
    async fn async_outcome_is_a_promise_not_a_sync_throw() {
        // The envelope must keep "returns a rejecting promise" distinct from
        // "throws synchronously".
        let program = program_with(provider().add(
            "index.js",
            r#"export function shape() {
                try {
                    const p = hostReject();
                    return (p && typeof p.then === "function") ? "promise" : "value";
                } catch (e) {
                    return "threw";
                }
            }
            export async function settle() {
                try { await hostReject(); return "resolved" } catch (e) { return "rejected" }
            }"#,
        ));
        program
            .bind_host_function(
                "hostReject",
                BridgedFunction::new(|_| HostOutcome::future(async { Err(json!(1)) })),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("shape", None, vec![]).await.unwrap(),
            json!("promise")
        );
        assert_eq!(
            module.call_method("settle", None, vec![]).await.unwrap(),
            json!("rejected")
        );
    }

    #[tokio::test]
    async fn bridged_functions_do_not_expose_the_safe_realm() {
        let program = program_with(provider().add(
            "index.js",
            r#"export function probe() {
                return Object.getPrototypeOf(hostNoop) === null
                    && !Object.prototype.hasOwnProperty.call(hostNoop, "prototype");
            }"#,
        ));
        program
            .bind_host_function(
                "hostNoop",
                BridgedFunction::new(|_| HostOutcome::Value(json!(null))),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("probe", None, vec![]).await.unwrap(),
            json!(true)
        );
    }

    #[tokio::test]
    async fn host_function_receives_copied_arguments() {
        let program = program_with(provider().add(
            "index.js",
            "export function send() { return hostEcho({a: 1, b: [true, \"x\"]}) }",
        ));
        program
            .bind_host_function(
                "hostEcho",
                BridgedFunction::new(|args| HostOutcome::Value(json!(args))),
            )
            .await
            .unwrap();
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("send", None, vec![]).await.unwrap(),
            json!([{"a": 1, "b": [true, "x"]}])
        );
    }
}
