//! Inspector sessions
//!
//! A session filters debug-protocol traffic before it reaches the engine
//! backend on the isolate thread:
//!
//! - `Runtime.compileScript` gets a synthesized `{fake: true}` success and
//!   is never forwarded — the engine cannot compile scripts from the
//!   inspector, but debugger UIs require a success reply.
//! - `Runtime.evaluate` is forwarded with `replMode` and `awaitPromise`
//!   stripped from its params; the engine rejects both options.
//!
//! Responses and notifications come back as events on the session channel.
//! A session and its program are linked through a dispose hook: the program
//! holds the only strong edge, the session only knows how to detach its own
//! hook, and either side disposing cleans up exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rquickjs::{Context, Value};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::ProgramError;
use crate::isolate::{caught_to_json, IsolateOp};
use crate::program::{ProgramInner, ProgramShared};
use crate::value::js_to_json;

/// Traffic re-emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectorEvent {
    /// Reply to a dispatched protocol message.
    Response(Json),
    /// Unsolicited engine notification.
    Notification(Json),
}

/// What the filter decided to do with one protocol message.
#[derive(Debug, PartialEq)]
pub(crate) enum FilterAction {
    /// Answer locally, do not forward.
    Reply(Json),
    /// Forward the (possibly edited) message to the backend.
    Forward(Json),
    /// Unparseable input, drop it.
    Drop,
}

/// Apply the two protocol edits. Pure, so the rules are testable without an
/// engine.
pub(crate) fn filter_message(raw: &str) -> FilterAction {
    let Ok(mut message) = serde_json::from_str::<Json>(raw) else {
        return FilterAction::Drop;
    };
    let method = message
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or_default();

    if method == "Runtime.compileScript" {
        let id = message.get("id").cloned().unwrap_or(Json::Null);
        return FilterAction::Reply(json!({ "id": id, "result": { "fake": true } }));
    }
    if method == "Runtime.evaluate" {
        if let Some(params) = message.get_mut("params").and_then(|p| p.as_object_mut()) {
            params.remove("replMode");
            params.remove("awaitPromise");
        }
    }
    FilterAction::Forward(message)
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    program: Weak<ProgramInner>,
    hook: AtomicU64,
    disposed: AtomicBool,
    events_tx: Mutex<Option<UnboundedSender<InspectorEvent>>>,
    events_rx: Mutex<Option<UnboundedReceiver<InspectorEvent>>>,
}

/// Handle over one debug session. State machine: created → open → disposed;
/// nothing leaves `disposed`, and dispatch on a disposed session is a
/// silent no-op.
#[derive(Debug)]
pub struct InspectorSession {
    inner: Arc<SessionInner>,
}

impl InspectorSession {
    pub(crate) fn open(program: &Arc<ProgramInner>) -> Self {
        let (tx, rx) = unbounded_channel();
        let inner = Arc::new(SessionInner {
            program: Arc::downgrade(program),
            hook: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        });
        // The program → session edge. Running the hook disposes the session;
        // the session disposing itself detaches the hook instead.
        let hooked = inner.clone();
        let hook = program.add_dispose_hook(Box::new(move || hooked.dispose_from_program()));
        inner.hook.store(hook, Ordering::SeqCst);
        Self { inner }
    }

    /// Parse, filter and forward one protocol message.
    pub fn dispatch_protocol_message(&self, raw: &str) -> Result<(), ProgramError> {
        if self.inner.is_disposed() {
            return Ok(());
        }
        match filter_message(raw) {
            FilterAction::Drop => {
                tracing::warn!(target: "roomscript::inspector", "dropping unparseable protocol message");
                Ok(())
            }
            FilterAction::Reply(response) => {
                self.inner.emit(InspectorEvent::Response(response));
                Ok(())
            }
            FilterAction::Forward(message) => {
                let Some(program) = self.inner.program.upgrade() else {
                    return Ok(());
                };
                let Some(events) = self.inner.sender() else {
                    return Ok(());
                };
                program.send(IsolateOp::Inspector { message, events })
            }
        }
    }

    /// Take the event stream. Yields each response and notification once.
    pub fn take_events(&self) -> Option<UnboundedReceiver<InspectorEvent>> {
        self.inner.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Dispose this session only. The program keeps running; the session's
    /// dispose hook is detached so teardown happens exactly once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.close_channel();
        if let Some(program) = self.inner.program.upgrade() {
            program.remove_dispose_hook(self.inner.hook.load(Ordering::SeqCst));
        }
        tracing::debug!(target: "roomscript::inspector", "inspector session disposed");
    }
}

impl SessionInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<UnboundedSender<InspectorEvent>> {
        self.events_tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn emit(&self, event: InspectorEvent) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(event);
        }
    }

    fn close_channel(&self) {
        if let Ok(mut tx) = self.events_tx.lock() {
            tx.take();
        }
    }

    /// Invoked by the program's dispose hook; must not try to detach the
    /// hook (the hook list is already being drained).
    fn dispose_from_program(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_channel();
    }
}

/// Engine-side handling of a forwarded message, on the isolate thread.
pub(crate) fn handle_backend(
    main: &Context,
    shared: &Arc<ProgramShared>,
    message: &Json,
    events: &UnboundedSender<InspectorEvent>,
) {
    let id = message.get("id").cloned().unwrap_or(Json::Null);
    let method = message
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or_default();

    let result = match method {
        "Runtime.enable" => {
            let _ = events.send(InspectorEvent::Notification(json!({
                "method": "Runtime.executionContextCreated",
                "params": { "context": { "id": 1, "origin": "", "name": "main" } },
            })));
            json!({})
        }
        "Runtime.evaluate" => {
            let expression = message
                .get("params")
                .and_then(|p| p.get("expression"))
                .and_then(|e| e.as_str())
                .unwrap_or_default()
                .to_string();
            evaluate_expression(main, shared, &expression)
        }
        // Everything else passes through as an empty success.
        _ => json!({}),
    };

    let _ = events.send(InspectorEvent::Response(json!({ "id": id, "result": result })));
}

fn evaluate_expression(main: &Context, shared: &Arc<ProgramShared>, expression: &str) -> Json {
    main.with(|ctx| {
        let run = || -> rquickjs::Result<Json> {
            let value: Value = {
                let _busy = shared.meter.enter();
                ctx.eval(expression)?
            };
            Ok(remote_object(js_to_json(&ctx, &value).unwrap_or(Json::Null), &value))
        };
        match run() {
            Ok(result) => json!({ "result": result }),
            Err(e) => {
                let detail = caught_to_json(&ctx, e);
                json!({ "exceptionDetails": { "text": detail.to_string() } })
            }
        }
    })
}

fn remote_object(cloned: Json, value: &Value<'_>) -> Json {
    let type_tag = if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "object"
    } else if value.is_function() {
        "function"
    } else {
        match &cloned {
            Json::Bool(_) => "boolean",
            Json::Number(_) => "number",
            Json::String(_) => "string",
            _ => "object",
        }
    };
    json!({ "type": type_tag, "value": cloned })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_script_is_answered_locally() {
        let action =
            filter_message(r#"{"id": 7, "method": "Runtime.compileScript", "params": {}}"#);
        match action {
            FilterAction::Reply(response) => {
                assert_eq!(response["id"], json!(7));
                assert_eq!(response["result"]["fake"], json!(true));
            }
            other => panic!("expected local reply, got {other:?}"),
        }
    }

    #[test]
    fn evaluate_loses_unsupported_params() {
        let action = filter_message(
            r#"{"id": 1, "method": "Runtime.evaluate",
                "params": {"expression": "1+1", "replMode": true, "awaitPromise": true, "silent": false}}"#,
        );
        match action {
            FilterAction::Forward(message) => {
                let params = message["params"].as_object().unwrap();
                assert!(!params.contains_key("replMode"));
                assert!(!params.contains_key("awaitPromise"));
                assert_eq!(params["expression"], json!("1+1"));
                assert_eq!(params["silent"], json!(false));
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn other_methods_forward_untouched() {
        let raw = r#"{"id": 2, "method": "Debugger.enable"}"#;
        match filter_message(raw) {
            FilterAction::Forward(message) => {
                assert_eq!(message, serde_json::from_str::<Json>(raw).unwrap());
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_dropped() {
        assert_eq!(filter_message("not json"), FilterAction::Drop);
    }
}
