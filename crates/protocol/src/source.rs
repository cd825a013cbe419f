//! Module sources and the host-supplied source provider

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Text of a module together with a loose type hint.
///
/// Only hints containing "json" (case-insensitive) change behavior: the text
/// is then treated as a JSON value and wrapped as the module's default
/// export. Anything else is a JS module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    pub text: String,
    pub hint: Option<String>,
}

impl ModuleSource {
    pub fn js(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hint: None,
        }
    }

    pub fn json(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hint: Some("json".to_string()),
        }
    }

    pub fn is_json(&self) -> bool {
        hint_is_json(self.hint.as_deref())
    }
}

/// Whether a type hint selects JSON module treatment.
pub fn hint_is_json(hint: Option<&str>) -> bool {
    hint.map(|h| h.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

/// Future yielding module source text, for providers that fetch lazily.
pub type SourceFuture = Pin<Box<dyn Future<Output = Result<ModuleSource, String>> + Send>>;

/// How the source text of a located module is obtained.
pub enum SourceFetch {
    /// Text is already in hand.
    Ready(ModuleSource),
    /// Text must be awaited (file read, network fetch, ...).
    Deferred(SourceFuture),
}

impl std::fmt::Debug for SourceFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(src) => f.debug_tuple("Ready").field(src).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A located module: its canonical name plus a way to get the text.
///
/// `name` may equal the requested descriptor or differ from it; when it
/// differs the module graph records the descriptor as an alias of `name`.
#[derive(Debug)]
pub struct SourceLocator {
    pub name: String,
    pub fetch: SourceFetch,
}

impl SourceLocator {
    pub fn ready(name: impl Into<String>, source: ModuleSource) -> Self {
        Self {
            name: name.into(),
            fetch: SourceFetch::Ready(source),
        }
    }

    pub fn deferred(name: impl Into<String>, future: SourceFuture) -> Self {
        Self {
            name: name.into(),
            fetch: SourceFetch::Deferred(future),
        }
    }
}

/// Host-supplied mapping from module descriptors to sources.
///
/// Returning `None` means the descriptor does not name a module; it never
/// enters the graph and the requester gets a module-not-found error.
pub trait SourceProvider: Send + Sync + 'static {
    fn locate(&self, descriptor: &str) -> Option<SourceLocator>;
}

impl<F> SourceProvider for F
where
    F: Fn(&str) -> Option<SourceLocator> + Send + Sync + 'static,
{
    fn locate(&self, descriptor: &str) -> Option<SourceLocator> {
        self(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_hint_is_case_insensitive_and_substring() {
        assert!(hint_is_json(Some("json")));
        assert!(hint_is_json(Some("application/JSON")));
        assert!(hint_is_json(Some("Json5")));
        assert!(!hint_is_json(Some("javascript")));
        assert!(!hint_is_json(None));
    }

    #[test]
    fn closure_acts_as_provider() {
        let provider = |d: &str| {
            (d == "index.js").then(|| SourceLocator::ready(d, ModuleSource::js("export {}")))
        };
        assert!(provider.locate("index.js").is_some());
        assert!(provider.locate("missing.js").is_none());
    }

    #[test]
    fn module_source_kinds() {
        assert!(ModuleSource::json("{}").is_json());
        assert!(!ModuleSource::js("export {}").is_json());
    }
}
