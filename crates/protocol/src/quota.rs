//! Execution quota configuration

use serde::{Deserialize, Serialize};

/// CPU quota for a sandboxed program.
///
/// The watchdog samples accumulated guest busy time every `checkout_ms`; if
/// the delta since the previous sample exceeds `max_busy_ns` the program is
/// disposed. Memory is bounded separately by the engine's hard limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Interval between watchdog samples (ms).
    pub checkout_ms: u64,
    /// Maximum guest busy time allowed between two samples (ns).
    pub max_busy_ns: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            checkout_ms: 10_000,
            max_busy_ns: 2_000_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let q = QuotaConfig::default();
        assert_eq!(q.checkout_ms, 10_000);
        assert_eq!(q.max_busy_ns, 2_000_000_000);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let q: QuotaConfig = serde_json::from_str(r#"{"checkout_ms": 50}"#).unwrap();
        assert_eq!(q.checkout_ms, 50);
        assert_eq!(q.max_busy_ns, 2_000_000_000);
    }
}
