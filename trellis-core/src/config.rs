//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`NotificationEngine`](crate::NotificationEngine).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use trellis_core::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{ "thread_name_prefix": "ui-notify" }"#).unwrap();
/// assert_eq!(config.thread_name_prefix, "ui-notify");
/// assert_eq!(config.max_handler_depth, EngineConfig::default().max_handler_depth);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name prefix for threads spawned by detached-thread dispatch.
    pub thread_name_prefix: String,

    /// How deeply the default exception handler may re-enter itself on one
    /// thread before it stops using the log sink and writes to stderr.
    pub max_handler_depth: usize,

    /// Whether listener panics are caught and routed through the exception
    /// handler stack. When false, a panicking listener unwinds into `notify`.
    pub catch_panics: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "trellis-notify".to_string(),
            max_handler_depth: 8,
            catch_panics: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_max_handler_depth(mut self, depth: usize) -> Self {
        self.max_handler_depth = depth.max(1);
        self
    }

    pub fn with_catch_panics(mut self, catch: bool) -> Self {
        self.catch_panics = catch;
        self
    }
}
