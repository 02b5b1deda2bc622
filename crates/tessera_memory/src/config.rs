//! # Memory Configuration
//!
//! Tuning knobs loaded once at startup from TOML. Every field has a default,
//! so an empty file is a valid configuration.
//!
//! ```toml
//! [pool]
//! chunks_per_page = 64
//!
//! [strings]
//! stack_capacity = 65536
//! initial_capacity = 1024
//!
//! [profiling]
//! event_capacity = 4096
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

/// Root configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Pool allocator settings.
    pub pool: PoolConfig,
    /// String interning settings.
    pub strings: StringPoolConfig,
    /// Profiler settings.
    pub profiling: ProfilingConfig,
}

impl MemoryConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on malformed TOML or out-of-range values.
    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::InvalidConfig(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "memory configuration loaded");
        Ok(config)
    }

    fn validate(&self) -> MemoryResult<()> {
        if self.pool.chunks_per_page == 0 {
            return Err(MemoryError::InvalidConfig("pool.chunks_per_page must be > 0".into()));
        }
        if self.strings.stack_capacity == 0 {
            return Err(MemoryError::InvalidConfig("strings.stack_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Pool allocator settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Chunks carved out of each page.
    pub chunks_per_page: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { chunks_per_page: 64 }
    }
}

/// String interning settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringPoolConfig {
    /// Bytes per string stack.
    pub stack_capacity: usize,
    /// Distinct strings the lookup set is sized for up front.
    pub initial_capacity: usize,
}

impl Default for StringPoolConfig {
    fn default() -> Self {
        Self {
            stack_capacity: 64 * 1024,
            initial_capacity: 1024,
        }
    }
}

/// Profiler settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Events the log is sized for up front.
    pub event_capacity: usize,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self { event_capacity: 4096 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MemoryConfig::from_toml_str("").unwrap();
        assert_eq!(config, MemoryConfig::default());
        assert_eq!(config.pool.chunks_per_page, 64);
    }

    #[test]
    fn test_partial_override() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [pool]
            chunks_per_page = 16

            [strings]
            stack_capacity = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.chunks_per_page, 16);
        assert_eq!(config.strings.stack_capacity, 4096);
        assert_eq!(config.strings.initial_capacity, 1024);
        assert_eq!(config.profiling.event_capacity, 4096);
    }

    #[test]
    fn test_rejects_zero_page_capacity() {
        let err = MemoryConfig::from_toml_str("[pool]\nchunks_per_page = 0\n").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(MemoryConfig::from_toml_str("[pool\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = MemoryConfig::load("/nonexistent/tessera.toml").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidConfig(_)));
    }
}
