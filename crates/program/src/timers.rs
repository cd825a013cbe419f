//! Timer bridge
//!
//! `setTimeout` / `setInterval` / `setImmediate` and their clears are
//! installed on the main global from natives created in the safe context.
//! The host owns every pending timer: guest callbacks live in an
//! isolate-local registry keyed `(kind, id)` and the native timers are tokio
//! tasks that post fire messages back to the isolate thread. Clearing
//! removes the registry entry immediately, so a fire that is already in
//! flight dispatches to nothing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::Sender;
use std::time::Duration;

use rquickjs::function::Opt;
use rquickjs::{Context, Ctx, Exception, Function, Persistent, Value};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::ProgramError;
use crate::isolate::IsolateOp;
use crate::stubs::SafeStubs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Timeout,
    Interval,
    Immediate,
}

impl TimerKind {
    fn index(self) -> usize {
        match self {
            Self::Timeout => 0,
            Self::Interval => 1,
            Self::Immediate => 2,
        }
    }
}

pub(crate) type TimerCell = Rc<RefCell<TimerRegistry>>;

/// Pending guest callbacks and their host-side timer tasks.
#[derive(Default)]
pub(crate) struct TimerRegistry {
    next_id: [u64; 3],
    callbacks: HashMap<(TimerKind, u64), Persistent<Function<'static>>>,
    aborts: HashMap<(TimerKind, u64), AbortHandle>,
}

impl TimerRegistry {
    /// Ids are positive and unique per kind for the program lifetime.
    fn alloc(&mut self, kind: TimerKind) -> u64 {
        let slot = &mut self.next_id[kind.index()];
        *slot += 1;
        *slot
    }

    fn register(
        &mut self,
        kind: TimerKind,
        id: u64,
        callback: Persistent<Function<'static>>,
        abort: Option<AbortHandle>,
    ) {
        self.callbacks.insert((kind, id), callback);
        if let Some(abort) = abort {
            self.aborts.insert((kind, id), abort);
        }
    }

    pub fn clear(&mut self, kind: TimerKind, id: u64) {
        self.callbacks.remove(&(kind, id));
        if let Some(abort) = self.aborts.remove(&(kind, id)) {
            abort.abort();
        }
    }

    /// Callback for a fire message; `None` when the timer was cleared.
    /// Timeout and immediate entries are consumed, intervals stay.
    pub fn on_fire(&mut self, kind: TimerKind, id: u64) -> Option<Persistent<Function<'static>>> {
        match kind {
            TimerKind::Timeout | TimerKind::Immediate => {
                self.aborts.remove(&(kind, id));
                self.callbacks.remove(&(kind, id))
            }
            TimerKind::Interval => self.callbacks.get(&(kind, id)).cloned(),
        }
    }

    /// Teardown: cancel every host timer and drop every guest callback.
    pub fn clear_all(&mut self) {
        for (_, abort) in self.aborts.drain() {
            abort.abort();
        }
        self.callbacks.clear();
    }
}

/// Build the timer native functions under the safe context guard.
fn install_natives<'js>(
    ctx: Ctx<'js>,
    stubs: &SafeStubs,
    registry: &TimerCell,
    op_tx: &Sender<IsolateOp>,
    handle: &Handle,
) -> rquickjs::Result<Vec<(&'static str, Persistent<Function<'static>>)>> {
    let mut out = Vec::new();
    // Guests see these functions; cut them loose from this realm.
    let detach = SafeStubs::restore(&stubs.detach, &ctx)?;

    let set_timeout = Function::new(ctx.clone(), {
        let registry = registry.clone();
        let op_tx = op_tx.clone();
        let handle = handle.clone();
        move |ctx: Ctx<'js>, cb: Value<'js>, delay: Opt<f64>| -> rquickjs::Result<f64> {
            schedule_delayed(
                &ctx,
                &registry,
                &op_tx,
                &handle,
                TimerKind::Timeout,
                cb,
                delay.0,
            )
        }
    })?;
    let set_timeout: Function = detach.call((set_timeout,))?;
    out.push(("setTimeout", Persistent::save(&ctx, set_timeout)));

    let set_interval = Function::new(ctx.clone(), {
        let registry = registry.clone();
        let op_tx = op_tx.clone();
        let handle = handle.clone();
        move |ctx: Ctx<'js>, cb: Value<'js>, delay: Opt<f64>| -> rquickjs::Result<f64> {
            schedule_delayed(
                &ctx,
                &registry,
                &op_tx,
                &handle,
                TimerKind::Interval,
                cb,
                delay.0,
            )
        }
    })?;
    let set_interval: Function = detach.call((set_interval,))?;
    out.push(("setInterval", Persistent::save(&ctx, set_interval)));

    // The optional time argument is accepted and ignored.
    let set_immediate = Function::new(ctx.clone(), {
        let registry = registry.clone();
        let op_tx = op_tx.clone();
        move |ctx: Ctx<'js>, cb: Value<'js>, _t: Opt<Value<'js>>| -> rquickjs::Result<f64> {
            let callback = require_function(&ctx, cb, "setImmediate")?;
            let mut reg = registry.borrow_mut();
            let id = reg.alloc(TimerKind::Immediate);
            reg.register(
                TimerKind::Immediate,
                id,
                Persistent::save(&ctx, callback),
                None,
            );
            let _ = op_tx.send(IsolateOp::TimerFired {
                kind: TimerKind::Immediate,
                id,
            });
            Ok(id as f64)
        }
    })?;
    let set_immediate: Function = detach.call((set_immediate,))?;
    out.push(("setImmediate", Persistent::save(&ctx, set_immediate)));

    for (name, kind) in [
        ("clearTimeout", TimerKind::Timeout),
        ("clearInterval", TimerKind::Interval),
        ("clearImmediate", TimerKind::Immediate),
    ] {
        let clear = Function::new(ctx.clone(), {
            let registry = registry.clone();
            move |id: Opt<f64>| {
                if let Some(id) = id.0 {
                    if id.is_finite() && id >= 1.0 {
                        registry.borrow_mut().clear(kind, id as u64);
                    }
                }
            }
        })?;
        let clear: Function = detach.call((clear,))?;
        out.push((name, Persistent::save(&ctx, clear)));
    }

    Ok(out)
}

/// Install the timer globals onto the main context. The natives are created
/// under the safe context guard so nothing about them is reachable from
/// guest name resolution, then assigned onto the main global.
pub(crate) fn install(
    main: &Context,
    safe: &Context,
    stubs: &SafeStubs,
    registry: TimerCell,
    op_tx: Sender<IsolateOp>,
    handle: Handle,
) -> Result<(), ProgramError> {
    let natives = safe
        .with(|ctx| install_natives(ctx, stubs, &registry, &op_tx, &handle))
        .map_err(install_error)?;

    main.with(|ctx| -> rquickjs::Result<()> {
        let globals = ctx.globals();
        for (name, func) in natives {
            globals.set(name, func.restore(&ctx)?)?;
        }
        Ok(())
    })
    .map_err(install_error)
}

fn schedule_delayed<'a>(
    ctx: &Ctx<'a>,
    registry: &TimerCell,
    op_tx: &Sender<IsolateOp>,
    handle: &Handle,
    kind: TimerKind,
    cb: Value<'a>,
    delay: Option<f64>,
) -> rquickjs::Result<f64> {
    let callback = require_function(ctx, cb, "timer")?;
    let delay_ms = delay.unwrap_or(0.0).max(0.0) as u64;

    let id = {
        let mut reg = registry.borrow_mut();
        reg.alloc(kind)
    };

    let op_tx = op_tx.clone();
    let abort = match kind {
        TimerKind::Timeout => handle
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = op_tx.send(IsolateOp::TimerFired { kind, id });
            })
            .abort_handle(),
        TimerKind::Interval => {
            let period = Duration::from_millis(delay_ms.max(1));
            handle
                .spawn(async move {
                    let start = tokio::time::Instant::now() + period;
                    let mut ticker = tokio::time::interval_at(start, period);
                    loop {
                        ticker.tick().await;
                        if op_tx.send(IsolateOp::TimerFired { kind, id }).is_err() {
                            break;
                        }
                    }
                })
                .abort_handle()
        }
        TimerKind::Immediate => unreachable!("immediates are posted directly"),
    };

    registry
        .borrow_mut()
        .register(kind, id, Persistent::save(ctx, callback), Some(abort));
    Ok(id as f64)
}

fn require_function<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
    what: &str,
) -> rquickjs::Result<Function<'js>> {
    if !value.is_function() {
        return Err(Exception::throw_type(
            ctx,
            &format!("{what} callback is not a function"),
        ));
    }
    value.get()
}

fn install_error(e: rquickjs::Error) -> ProgramError {
    ProgramError::Init(format!("timer bridge installation failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{program_with, provider};
    use serde_json::json;

    #[test]
    fn ids_are_positive_and_unique_per_kind() {
        let mut reg = TimerRegistry::default();
        let a = reg.alloc(TimerKind::Timeout);
        let b = reg.alloc(TimerKind::Timeout);
        let c = reg.alloc(TimerKind::Interval);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        // Kinds count independently.
        assert_eq!(c, 1);
    }

    #[test]
    fn cleared_timer_does_not_dispatch() {
        let mut reg = TimerRegistry::default();
        let id = reg.alloc(TimerKind::Timeout);
        // No callback registered for a cleared id: on_fire finds nothing.
        reg.clear(TimerKind::Timeout, id);
        assert!(reg.on_fire(TimerKind::Timeout, id).is_none());
    }

    const TIMER_SRC: &str = r#"
        let fired = 0;
        export function count() { return fired }
        export function arm(ms) { return setTimeout(() => { fired += 1 }, ms) }
        export function armAndCancel(ms) {
            const id = setTimeout(() => { fired += 1 }, ms);
            clearTimeout(id);
            return id;
        }
        export function repeat(ms) { return setInterval(() => { fired += 1 }, ms) }
        export function stopRepeat(id) { clearInterval(id) }
        export function soon() { return setImmediate(() => { fired += 1 }, 12345) }
        export function badCallback() {
            try { setTimeout(42, 0); return "no-throw" }
            catch (e) { return (e instanceof TypeError) ? "type-error" : "other" }
        }
    "#;

    async fn count(module: &crate::ProgramModule) -> i64 {
        module
            .call_method("count", None, vec![])
            .await
            .unwrap()
            .as_i64()
            .unwrap()
    }

    #[tokio::test]
    async fn timeout_fires_once() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        let id = module.call_method("arm", None, vec![json!(10)]).await.unwrap();
        assert_eq!(id, json!(1.0));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(count(&module).await, 1);
        // One-shot: no further fires.
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(count(&module).await, 1);
    }

    #[tokio::test]
    async fn cleared_timeout_never_fires() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        module
            .call_method("armAndCancel", None, vec![json!(5)])
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(count(&module).await, 0);
    }

    #[tokio::test]
    async fn interval_repeats_until_cleared() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        let id = module.call_method("repeat", None, vec![json!(10)]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        let seen = count(&module).await;
        assert!(seen >= 2, "interval fired only {seen} times");
        module.call_method("stopRepeat", None, vec![id]).await.unwrap();
        let frozen = count(&module).await;
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(count(&module).await, frozen);
    }

    #[tokio::test]
    async fn immediate_fires_and_ignores_time_argument() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        module.call_method("soon", None, vec![]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count(&module).await, 1);
    }

    #[tokio::test]
    async fn non_function_callback_is_a_guest_type_error() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        assert_eq!(
            module.call_method("badCallback", None, vec![]).await.unwrap(),
            json!("type-error")
        );
    }

    #[tokio::test]
    async fn timer_ids_count_independently_per_kind() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        let t1 = module.call_method("arm", None, vec![json!(1)]).await.unwrap();
        let t2 = module.call_method("arm", None, vec![json!(1)]).await.unwrap();
        let i1 = module.call_method("repeat", None, vec![json!(1000)]).await.unwrap();
        assert_eq!(t1, json!(1.0));
        assert_eq!(t2, json!(2.0));
        assert_eq!(i1, json!(1.0));
    }

    #[tokio::test]
    async fn dispose_cancels_pending_timers() {
        let program = program_with(provider().add("index.js", TIMER_SRC));
        let module = program.get_module("index.js").await.unwrap();
        module.call_method("arm", None, vec![json!(5)]).await.unwrap();
        module.call_method("repeat", None, vec![json!(5)]).await.unwrap();
        program.dispose();
        // Nothing fires after disposal and later calls report it.
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        let err = module.call_method("count", None, vec![]).await.unwrap_err();
        assert_eq!(err, ProgramError::IsolateDisposed);
    }
}
