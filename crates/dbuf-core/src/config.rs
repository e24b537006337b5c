//! Budgets for the three cache subsystems.

use dbuf_error::{DbufError, Result};
use serde::{Deserialize, Serialize};

/// Byte ceilings for the resident set, the write-back buffer and pinned small
/// objects.
///
/// A budget of 0 disables that subsystem, so the default configuration caches
/// nothing and every `touch` is a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Memory ceiling for MRU-resident objects.
    pub resident_budget: u64,
    /// Pending bytes that trigger a write-back flush. 0 saves evictions
    /// synchronously instead.
    pub write_buffer_budget: u64,
    /// Total memory granted to pinned small objects; divided evenly across
    /// the configured id slots to get the per-object threshold.
    pub small_object_budget: u64,
}

impl CacheConfig {
    #[must_use]
    pub const fn with_resident_budget(mut self, bytes: u64) -> Self {
        self.resident_budget = bytes;
        self
    }

    #[must_use]
    pub const fn with_write_buffer_budget(mut self, bytes: u64) -> Self {
        self.write_buffer_budget = bytes;
        self
    }

    #[must_use]
    pub const fn with_small_object_budget(mut self, bytes: u64) -> Self {
        self.small_object_budget = bytes;
        self
    }

    /// Parse and validate a JSON configuration.
    ///
    /// Missing fields default to 0; unknown fields are rejected.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DbufError::InvalidConfig(format!("malformed JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_budget > 0 && self.resident_budget == 0 {
            return Err(DbufError::InvalidConfig(
                "write_buffer_budget requires a non-zero resident_budget".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_disables_everything() {
        let config = CacheConfig::default();
        assert_eq!(config.resident_budget, 0);
        assert_eq!(config.write_buffer_budget, 0);
        assert_eq!(config.small_object_budget, 0);
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_json() {
        let config =
            CacheConfig::from_json_str(r#"{"resident_budget": 1000, "write_buffer_budget": 500}"#)
                .unwrap();
        assert_eq!(
            config,
            CacheConfig::default()
                .with_resident_budget(1000)
                .with_write_buffer_budget(500)
        );
    }

    #[test]
    fn rejects_unknown_fields_and_bad_json() {
        for bad in [r#"{"resident": 1}"#, "not json", r#"{"resident_budget": -1}"#] {
            let err = CacheConfig::from_json_str(bad).unwrap_err();
            assert!(matches!(err, DbufError::InvalidConfig(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn write_buffer_without_resident_set_is_invalid() {
        let config = CacheConfig::default().with_write_buffer_budget(10);
        assert!(config.validate().is_err());
    }
}
