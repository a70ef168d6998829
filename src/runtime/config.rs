//! Engine configuration.

use crate::runtime::error::BridgeError;
use crate::runtime::module::ModuleRegistry;
use crate::runtime::sys::EnvOptions;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Configuration for one engine thread and the environment it owns.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name given to the engine's OS thread.
    pub thread_name: String,

    /// Size of the pool that runs async work bodies.
    pub async_work_threads: usize,

    /// Queue bound used by threadsafe functions that do not set one (0 = unbounded).
    pub default_max_queue_size: usize,

    /// Nesting limit for dynamic conversions.
    pub max_conversion_depth: usize,

    /// Byte budget for one dynamic conversion.
    pub max_conversion_bytes: usize,

    /// Registration callbacks run at startup. `None` uses the process-wide registry.
    #[serde(skip)]
    pub module_registry: Option<Arc<ModuleRegistry>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let options = EnvOptions::default();
        Self {
            thread_name: "jsbridge-engine".to_string(),
            async_work_threads: options.async_work_threads,
            default_max_queue_size: options.default_max_queue_size,
            max_conversion_depth: options.max_conversion_depth,
            max_conversion_bytes: options.max_conversion_bytes,
            module_registry: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("thread_name", &self.thread_name)
            .field("async_work_threads", &self.async_work_threads)
            .field("default_max_queue_size", &self.default_max_queue_size)
            .field("max_conversion_depth", &self.max_conversion_depth)
            .field("max_conversion_bytes", &self.max_conversion_bytes)
            .field(
                "module_registry",
                &self.module_registry.as_ref().map(|registry| registry.names()),
            )
            .finish()
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_async_work_threads(mut self, threads: usize) -> Self {
        self.async_work_threads = threads;
        self
    }

    pub fn with_default_max_queue_size(mut self, size: usize) -> Self {
        self.default_max_queue_size = size;
        self
    }

    pub fn with_max_conversion_depth(mut self, depth: usize) -> Self {
        self.max_conversion_depth = depth;
        self
    }

    pub fn with_max_conversion_bytes(mut self, bytes: usize) -> Self {
        self.max_conversion_bytes = bytes;
        self
    }

    pub fn with_module_registry(mut self, registry: Arc<ModuleRegistry>) -> Self {
        self.module_registry = Some(registry);
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.async_work_threads == 0 {
            return Err(BridgeError::runtime(
                "async_work_threads must be at least 1",
            ));
        }
        if self.max_conversion_depth == 0 {
            return Err(BridgeError::runtime(
                "max_conversion_depth must be at least 1",
            ));
        }
        Ok(())
    }

    pub(crate) fn to_env_options(&self) -> EnvOptions {
        EnvOptions {
            async_work_threads: self.async_work_threads,
            default_max_queue_size: self.default_max_queue_size,
            max_conversion_depth: self.max_conversion_depth,
            max_conversion_bytes: self.max_conversion_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.thread_name, "jsbridge-engine");
        assert_eq!(config.async_work_threads, 4);
        assert_eq!(config.default_max_queue_size, 0);
        assert_eq!(config.max_conversion_depth, 100);
        assert_eq!(config.max_conversion_bytes, 10 * 1024 * 1024);
        assert!(config.module_registry.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_thread_name("worker-js")
            .with_async_work_threads(1)
            .with_default_max_queue_size(16);

        assert_eq!(config.thread_name, "worker-js");
        assert_eq!(config.async_work_threads, 1);
        let options = config.to_env_options();
        assert_eq!(options.async_work_threads, 1);
        assert_eq!(options.default_max_queue_size, 16);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let err = EngineConfig::new()
            .with_async_work_threads(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("async_work_threads"));

        let err = EngineConfig::new()
            .with_max_conversion_depth(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_conversion_depth"));
    }

    #[test]
    fn test_load_from_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"thread_name": "js", "async_work_threads": 2}"#).unwrap();
        assert_eq!(config.thread_name, "js");
        assert_eq!(config.async_work_threads, 2);
        assert_eq!(config.max_conversion_depth, 100);
        assert!(config.module_registry.is_none());
    }

    #[test]
    fn test_debug_lists_registered_modules() {
        let registry = ModuleRegistry::new();
        registry
            .register("fs", |_env, _exports| Ok(()))
            .unwrap();
        let config = EngineConfig::new().with_module_registry(Arc::new(registry));
        assert!(format!("{:?}", config).contains("\"fs\""));
    }
}
