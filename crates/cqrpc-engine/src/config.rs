//! Engine configuration

use cqrpc_core::env::{env_get, env_get_opt};

/// Hard upper bound on event queues per engine.
pub const MAX_QUEUES: usize = 64;

/// Default values, overridable through `CQRPC_*` environment variables.
pub mod defaults {
    /// Default cap on queues when sizing from the CPU count.
    pub const NUM_QUEUES_CAP: usize = 4;
    pub const THREAD_NAME_PREFIX: &str = "cqrpc-cq";
}

/// Configuration for [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of event queues, each drained by its own worker thread.
    pub num_queues: usize,

    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,

    /// Stack size for worker threads (None = system default).
    pub stack_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            num_queues: num_cpus.min(defaults::NUM_QUEUES_CAP),
            thread_name_prefix: defaults::THREAD_NAME_PREFIX.into(),
            stack_size: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `CQRPC_NUM_QUEUES` and `CQRPC_STACK_SIZE`.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            num_queues: env_get("CQRPC_NUM_QUEUES", base.num_queues),
            stack_size: env_get_opt("CQRPC_STACK_SIZE").or(base.stack_size),
            ..base
        }
    }

    pub fn num_queues(mut self, n: usize) -> Self {
        self.num_queues = n;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_queues == 0 {
            return Err("num_queues must be > 0");
        }
        if self.num_queues > MAX_QUEUES {
            return Err("num_queues exceeds MAX_QUEUES");
        }
        if self.thread_name_prefix.is_empty() {
            return Err("thread_name_prefix must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.num_queues >= 1);
        assert!(config.num_queues <= defaults::NUM_QUEUES_CAP);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .num_queues(3)
            .thread_name_prefix("rpc")
            .stack_size(256 * 1024);
        assert_eq!(config.num_queues, 3);
        assert_eq!(config.thread_name_prefix, "rpc");
        assert_eq!(config.stack_size, Some(256 * 1024));
    }

    #[test]
    fn test_validate_rejects() {
        assert!(EngineConfig::new().num_queues(0).validate().is_err());
        assert!(EngineConfig::new().num_queues(MAX_QUEUES + 1).validate().is_err());
        assert!(EngineConfig::new().thread_name_prefix("").validate().is_err());
    }
}
