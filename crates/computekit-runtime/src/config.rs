//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default shader model for compute kernels.
pub const DEFAULT_SHADER_PROFILE: &str = "cs_6_0";

/// Configuration for a [`ComputeContext`](crate::ComputeContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Command lists that may be in flight at once (pool capacity).
    pub max_in_flight: usize,
    /// How long `acquire` waits for a free command list.
    pub acquire_timeout: Duration,
    /// How long fence waits block before failing.
    pub fence_timeout: Duration,
    /// Shader model passed to the compiler.
    pub shader_profile: String,
    /// Whether compiled bytecode is cached on disk.
    pub bytecode_cache: bool,
    /// Disk cache directory. `None` uses the default location.
    pub bytecode_cache_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            acquire_timeout: Duration::from_secs(5),
            fence_timeout: Duration::from_secs(10),
            shader_profile: DEFAULT_SHADER_PROFILE.to_string(),
            bytecode_cache: false,
            bytecode_cache_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Creates a minimal configuration (one command list, fully serialized).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_in_flight: 1,
            ..Self::default()
        }
    }

    /// Creates a configuration for many small back-to-back dispatches.
    #[must_use]
    pub fn throughput() -> Self {
        Self {
            max_in_flight: 8,
            acquire_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }
}

/// Builder for RuntimeConfig.
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a minimal configuration builder.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: RuntimeConfig::minimal(),
        }
    }

    /// Creates a throughput configuration builder.
    #[must_use]
    pub fn throughput() -> Self {
        Self {
            config: RuntimeConfig::throughput(),
        }
    }

    /// Sets the pool capacity. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_in_flight(mut self, count: usize) -> Self {
        self.config.max_in_flight = count.max(1);
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Sets the fence wait timeout.
    #[must_use]
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.config.fence_timeout = timeout;
        self
    }

    /// Sets the shader profile.
    #[must_use]
    pub fn with_shader_profile(mut self, profile: impl Into<String>) -> Self {
        self.config.shader_profile = profile.into();
        self
    }

    /// Enables or disables the bytecode disk cache.
    #[must_use]
    pub fn with_bytecode_cache(mut self, enabled: bool) -> Self {
        self.config.bytecode_cache = enabled;
        self
    }

    /// Enables the bytecode disk cache in a specific directory.
    #[must_use]
    pub fn with_bytecode_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.bytecode_cache = true;
        self.config.bytecode_cache_dir = Some(dir.into());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_in_flight, 3);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.fence_timeout, Duration::from_secs(10));
        assert_eq!(config.shader_profile, "cs_6_0");
        assert!(!config.bytecode_cache);
    }

    #[test]
    fn test_runtime_config_presets() {
        assert_eq!(RuntimeConfig::minimal().max_in_flight, 1);

        let config = RuntimeConfig::throughput();
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert!(!config.bytecode_cache);
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfigBuilder::minimal()
            .with_max_in_flight(0)
            .with_acquire_timeout(Duration::from_millis(50))
            .with_fence_timeout(Duration::from_millis(100))
            .with_shader_profile("cs_6_6")
            .with_bytecode_cache_dir("/tmp/shaders")
            .build();

        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
        assert_eq!(config.fence_timeout, Duration::from_millis(100));
        assert_eq!(config.shader_profile, "cs_6_6");
        assert!(config.bytecode_cache);
        assert_eq!(config.bytecode_cache_dir, Some(PathBuf::from("/tmp/shaders")));
    }
}
