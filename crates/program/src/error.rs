//! Program error types

use serde_json::Value as Json;
use thiserror::Error;

/// Errors from the sandbox core.
///
/// `Guest` carries whatever the guest threw, structured-cloned, so that
/// `throw 31` in guest code is observable as `31` on the host side. The
/// watchdog and memory-limit paths always surface `IsolateDisposed`, never
/// the underlying engine fault.
///
/// Clone is required so that a failed module graph entry can replay the same
/// error to every later request for that module.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProgramError {
    #[error("module not found: {descriptor}{}", importer_suffix(.from))]
    ModuleNotFound {
        descriptor: String,
        from: Option<String>,
    },

    #[error("module already exists: {0}")]
    ModuleAlreadyExists(String),

    #[error("private module {specifier} imported from {referrer}")]
    PrivateModule {
        specifier: String,
        referrer: String,
    },

    #[error("failed to compile {module}: {message}")]
    Compile { module: String, message: String },

    #[error("failed to instantiate {module}: {message}")]
    Instantiate { module: String, message: String },

    #[error("failed to evaluate {module}: {message}")]
    Evaluate { module: String, message: String },

    /// A value thrown by guest code, passed through verbatim.
    #[error("guest error: {0}")]
    Guest(Json),

    #[error("isolate disposed")]
    IsolateDisposed,

    #[error("inspector is not enabled for this program")]
    InspectorDisabled,

    /// The resolver was invoked for a module the graph does not track.
    /// Should not occur; indicates a bug in the embedding.
    #[error("unknown referrer module: {0}")]
    UnknownReferrer(String),

    #[error("program initialization failed: {0}")]
    Init(String),
}

impl ProgramError {
    /// The thrown guest value, when this is a guest error.
    pub fn guest_value(&self) -> Option<&Json> {
        match self {
            Self::Guest(v) => Some(v),
            _ => None,
        }
    }
}

fn importer_suffix(from: &Option<String>) -> String {
    match from {
        Some(referrer) => format!(" (imported from {referrer})"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn module_not_found_mentions_importer() {
        let e = ProgramError::ModuleNotFound {
            descriptor: "a.js".into(),
            from: Some("index.js".into()),
        };
        let msg = e.to_string();
        assert!(msg.contains("a.js"));
        assert!(msg.contains("index.js"));

        let bare = ProgramError::ModuleNotFound {
            descriptor: "a.js".into(),
            from: None,
        };
        assert!(!bare.to_string().contains("imported from"));
    }

    #[test]
    fn guest_value_is_verbatim() {
        let e = ProgramError::Guest(json!(31));
        assert_eq!(e.guest_value(), Some(&json!(31)));
        assert_eq!(ProgramError::IsolateDisposed.guest_value(), None);
    }
}
