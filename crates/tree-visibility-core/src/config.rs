//! Configuration for the visibility engine.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, VisibilityError};

/// Tunables shared by the id relationship cache, the always/never-drawn
/// element info and the change event listener.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tree_visibility_core::VisibilityConfig;
///
/// let config = VisibilityConfig::new()
///     .with_ids_batch_window(Duration::from_millis(5))
///     .with_change_debounce(Duration::from_millis(20));
/// assert_eq!(config.ids_max_batch_size, 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisibilityConfig {
    /// How long the id cache buffers requests before compiling a batch.
    #[serde(rename = "ids_batch_window_ms", with = "duration_ms")]
    pub ids_batch_window: Duration,
    /// A batch is flushed early once it holds this many requests.
    pub ids_max_batch_size: usize,
    /// Capacity of the id cache request channel.
    pub ids_request_queue_capacity: usize,
    /// Debounce window of the visibility change event listener.
    #[serde(rename = "change_debounce_ms", with = "duration_ms")]
    pub change_debounce: Duration,
    /// Prefix of the restart tokens used by always/never-drawn queries.
    pub drawn_info_restart_token_prefix: String,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            ids_batch_window: Duration::from_millis(20),
            ids_max_batch_size: 1000,
            ids_request_queue_capacity: 1024,
            change_debounce: Duration::from_millis(10),
            drawn_info_restart_token_prefix: "AlwaysAndNeverDrawnElementInfo".to_string(),
        }
    }
}

impl VisibilityConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the id cache buffering window.
    pub fn with_ids_batch_window(mut self, window: Duration) -> Self {
        self.ids_batch_window = window;
        self
    }

    /// Set the maximum number of requests per id cache batch.
    pub fn with_ids_max_batch_size(mut self, size: usize) -> Self {
        self.ids_max_batch_size = size;
        self
    }

    /// Set the id cache request channel capacity.
    pub fn with_ids_request_queue_capacity(mut self, capacity: usize) -> Self {
        self.ids_request_queue_capacity = capacity;
        self
    }

    /// Set the change notification debounce window.
    pub fn with_change_debounce(mut self, debounce: Duration) -> Self {
        self.change_debounce = debounce;
        self
    }

    /// Check invariants that the type system does not cover.
    pub fn validate(&self) -> Result<()> {
        if self.ids_max_batch_size == 0 {
            return Err(VisibilityError::config("ids_max_batch_size must be positive"));
        }
        if self.ids_request_queue_capacity == 0 {
            return Err(VisibilityError::config(
                "ids_request_queue_capacity must be positive",
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VisibilityConfig::default();
        assert_eq!(config.ids_batch_window, Duration::from_millis(20));
        assert_eq!(config.change_debounce, Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            VisibilityConfig::from_json_str(r#"{ "ids_batch_window_ms": 5, "ids_max_batch_size": 10 }"#)
                .unwrap();
        assert_eq!(config.ids_batch_window, Duration::from_millis(5));
        assert_eq!(config.ids_max_batch_size, 10);
        assert_eq!(config.change_debounce, Duration::from_millis(10));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            VisibilityConfig::from_json_str(r#"{ "ids_max_batch_size": 0 }"#),
            Err(VisibilityError::Config { .. })
        ));
        assert!(matches!(
            VisibilityConfig::from_json_str(r#"{ "unknown": 1 }"#),
            Err(VisibilityError::Config { .. })
        ));
    }
}
