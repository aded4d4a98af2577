//! Bridge Configuration
//!
//! Settings for the replication bridge.

use std::str::FromStr;

/// Deepest source or target path a mapping may use.
pub const MAX_PATH_DEPTH: usize = 16;

/// Upper bound accepted for `BridgeConfig::max_depth`.
pub const DEPTH_LIMIT: usize = 64;

/// Where propagation passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the thread that committed the change.
    #[default]
    Direct,
    /// On a dedicated worker thread owned by the bridge.
    Worker,
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "worker" => Ok(Self::Worker),
            other => Err(ConfigError::UnknownDispatch(other.to_string())),
        }
    }
}

/// Configuration for a `ReplicationBridge`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum number of components in a mapping path (default: 16)
    pub max_depth: usize,

    /// Where passes run (default: direct)
    pub dispatch: DispatchMode,

    /// Thread name used in worker mode
    pub worker_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_depth: MAX_PATH_DEPTH,
            dispatch: DispatchMode::Direct,
            worker_name: "revflow-bridge".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum path depth.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the dispatch mode.
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Set the worker thread name.
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.max_depth > DEPTH_LIMIT {
            return Err(ConfigError::DepthTooLarge(self.max_depth));
        }
        if self.dispatch == DispatchMode::Worker && self.worker_name.is_empty() {
            return Err(ConfigError::MissingWorkerName);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_depth must be positive")]
    ZeroDepth,
    #[error("max_depth {0} exceeds the limit of 64")]
    DepthTooLarge(usize),
    #[error("worker_name is required in worker mode")]
    MissingWorkerName,
    #[error("unknown dispatch mode: {0}")]
    UnknownDispatch(String),
}
