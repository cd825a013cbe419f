//! Module descriptor grammar and specifier resolution
//!
//! A descriptor is a URL-like string: `[<protocol>:]<path>[?<query>][#<hash>]`.
//! Canonical module names follow the same grammar. Names are not required to
//! be absolute URLs, so relative resolution is implemented here instead of
//! leaning on a full URL parser.
//!
//! Fragment rules carry the private-module convention:
//! - a specifier *starting* with `#` selects a private submodule of the
//!   importing module (`referrer + specifier`);
//! - a specifier merely *containing* `#` reaches into another module's
//!   private space and is only legal for privileged (builtin) referrers.

use serde::{Deserialize, Serialize};

/// A parsed module descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Scheme-like prefix without the trailing `:` (e.g. `room` in `room:rpc`).
    pub protocol: Option<String>,
    /// Path portion, including any extension.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Fragment without the leading `#`.
    pub hash: Option<String>,
}

impl Descriptor {
    /// Parse a descriptor string. Never fails: every string is some descriptor.
    pub fn parse(input: &str) -> Self {
        let (rest, hash) = match input.split_once('#') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (input, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q.to_string())),
            None => (rest, None),
        };
        let (protocol, path) = match split_protocol(rest) {
            Some((p, tail)) => (Some(p.to_string()), tail.to_string()),
            None => (None, rest.to_string()),
        };
        Self {
            protocol,
            path,
            query,
            hash,
        }
    }

    /// The extension of the path portion, if any (`js` in `lib/a.js`).
    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext)
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(p) = &self.protocol {
            write!(f, "{p}:")?;
        }
        write!(f, "{}", self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        if let Some(h) = &self.hash {
            write!(f, "#{h}")?;
        }
        Ok(())
    }
}

/// Whether the specifier selects a private submodule of its referrer.
pub fn is_private_specifier(specifier: &str) -> bool {
    specifier.starts_with('#')
}

/// Whether the specifier reaches into another module's private space.
pub fn crosses_private_boundary(specifier: &str) -> bool {
    !specifier.starts_with('#') && specifier.contains('#')
}

/// Split a leading `protocol:` prefix off a descriptor, if present.
///
/// A protocol is an ASCII letter followed by letters, digits, `+`, `-` or
/// `.`, terminated by `:`. Plain file-ish names (`index.js`) have none.
fn split_protocol(input: &str) -> Option<(&str, &str)> {
    let colon = input.find(':')?;
    let head = &input[..colon];
    let mut chars = head.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some((head, &input[colon + 1..]))
}

/// Resolve an import specifier against the canonical name of its referrer.
///
/// Absolute specifiers (carrying a protocol) pass through unchanged. All
/// others resolve path-relatively against the referrer: the referrer's
/// fragment is dropped, the last path segment is replaced, and `.`/`..`
/// segments are normalized. The specifier's own query and fragment are kept.
pub fn resolve_specifier(referrer: &str, specifier: &str) -> String {
    if split_protocol(specifier).is_some() {
        return specifier.to_string();
    }

    let base = Descriptor::parse(referrer);
    let prefix = base
        .protocol
        .as_deref()
        .map(|p| format!("{p}:"))
        .unwrap_or_default();

    let spec = Descriptor::parse(specifier);
    let suffix = {
        let mut s = String::new();
        if let Some(q) = &spec.query {
            s.push('?');
            s.push_str(q);
        }
        if let Some(h) = &spec.hash {
            s.push('#');
            s.push_str(h);
        }
        s
    };

    if let Some(rooted) = spec.path.strip_prefix('/') {
        return format!("{prefix}{}{suffix}", normalize_path(rooted));
    }

    let base_dir = match base.path.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/"),
        None => String::new(),
    };
    let joined = format!("{base_dir}{}", spec.path);
    format!("{prefix}{}{suffix}", normalize_path(&joined))
}

/// Collapse `.` and `..` path segments. `..` at the root is dropped.
fn normalize_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}
