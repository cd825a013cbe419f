//! Roomscript Program
//!
//! Embeds untrusted per-room guest scripts in a QuickJS sandbox and gives
//! the host:
//!
//! - isolate lifecycle with hard memory caps, a CPU watchdog and total,
//!   idempotent teardown of every cross-boundary resource;
//! - a lazy, deduplicated, aliased module graph with builtin modules,
//!   private (`#`) submodules and host-provided sources;
//! - a bidirectional value bridge preserving error and promise semantics,
//!   plus host-owned virtual timers observable from the guest.
//!
//! Guest code runs in the `main` context; every host helper that touches
//! guest values is compiled in a second `safe` context out of reach of
//! guest name resolution.
//!
//! ```no_run
//! use std::sync::Arc;
//! use roomscript_program::{Program, ProgramOptions};
//! use roomscript_protocol::{ModuleSource, SourceLocator};
//!
//! # async fn demo() -> Result<(), roomscript_program::ProgramError> {
//! let provider = |descriptor: &str| {
//!     (descriptor == "index.js").then(|| {
//!         SourceLocator::ready(
//!             descriptor,
//!             ModuleSource::js("export function inc(x) { return x + 1 }"),
//!         )
//!     })
//! };
//! let program = Program::new(Arc::new(provider), ProgramOptions::default())?;
//! let module = program.get_module("index.js").await?;
//! let eleven = module.call_method("inc", None, vec![10.into()]).await?;
//! # assert_eq!(eleven, serde_json::json!(11));
//! program.dispose();
//! # Ok(())
//! # }
//! ```

mod bridge;
mod error;
mod graph;
mod inspector;
mod isolate;
mod module;
mod program;
mod stubs;
mod timers;
mod value;
mod watchdog;

pub use bridge::{BridgedFunction, HostFunction, HostFuture, HostOutcome};
pub use error::ProgramError;
pub use graph::ModuleKind;
pub use inspector::{InspectorEvent, InspectorSession};
pub use module::ProgramModule;
pub use program::{HookId, MemoryStats, Program, ProgramOptions, RpcOptions};

pub use roomscript_protocol as protocol;
