//! Engine configuration resolved from code and environment variables.

use serde::{Deserialize, Serialize};

use crate::osr::OSR_LOOP_THRESHOLD;

/// Default nesting limit for bytecode activations.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 256;

/// Tunables of an [`Engine`](crate::Engine).
///
/// None of these change what a program computes; they only pick the execution
/// strategy and the point at which runaway recursion is cut off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Back-edge count that makes a loop hot. `None` disables OSR.
    pub osr_threshold: Option<u64>,
    /// Nested activations allowed before `RecursionError` is raised.
    pub max_recursion_depth: usize,
    /// Whether call sites cache their resolved operation.
    pub specialize: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            osr_threshold: Some(OSR_LOOP_THRESHOLD),
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            specialize: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn osr_threshold(mut self, threshold: Option<u64>) -> Self {
        self.osr_threshold = threshold;
        self
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    #[must_use]
    pub fn specialize(mut self, enabled: bool) -> Self {
        self.specialize = enabled;
        self
    }

    /// Defaults overlaid with `BASALT_OSR_THRESHOLD`, `BASALT_MAX_RECURSION_DEPTH`
    /// and `BASALT_SPECIALIZE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env(|var| std::env::var(var).ok())
    }

    /// Overlays settings read through `lookup`; unparsable values are ignored.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup("BASALT_OSR_THRESHOLD") {
            match raw.trim() {
                "off" | "none" => self.osr_threshold = None,
                value => match value.parse::<u64>() {
                    Ok(threshold) => self.osr_threshold = Some(threshold.max(1)),
                    Err(_) => tracing::warn!(value = %raw, "ignoring invalid BASALT_OSR_THRESHOLD"),
                },
            }
        }
        if let Some(raw) = lookup("BASALT_MAX_RECURSION_DEPTH") {
            match raw.trim().parse::<usize>() {
                Ok(depth) if depth > 0 => self.max_recursion_depth = depth,
                _ => tracing::warn!(value = %raw, "ignoring invalid BASALT_MAX_RECURSION_DEPTH"),
            }
        }
        if let Some(raw) = lookup("BASALT_SPECIALIZE") {
            match raw.trim() {
                "1" | "on" | "true" => self.specialize = true,
                "0" | "off" | "false" => self.specialize = false,
                _ => tracing::warn!(value = %raw, "ignoring invalid BASALT_SPECIALIZE"),
            }
        }
        self
    }
}
