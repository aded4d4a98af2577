use crate::replication::{BridgeConfig, DispatchMode, DEFAULT_MAX_FRAME, MAX_PATH_DEPTH};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Node identity
    pub node_id: String,
    pub debug: bool,

    // Replication bridge settings
    pub bridge_max_depth: usize,
    pub bridge_dispatch: String,

    // Transport settings
    pub frame_max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            debug: false,
            bridge_max_depth: MAX_PATH_DEPTH,
            bridge_dispatch: "direct".to_string(),
            frame_max_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl Config {
    /// Bridge settings derived from this configuration.
    pub fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let dispatch: DispatchMode = self.bridge_dispatch.parse()?;
        let config = BridgeConfig::new()
            .max_depth(self.bridge_max_depth)
            .dispatch(dispatch)
            .worker_name(format!("revflow-bridge-{}", self.node_id));
        config.validate()?;
        Ok(config)
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let node_id = std::env::var("REVFLOW_NODE_ID").unwrap_or_else(|_| "node-1".to_string());

    let debug = std::env::var("DEBUG").is_ok();

    // Replication bridge settings
    let bridge_max_depth = std::env::var("REVFLOW_BRIDGE_MAX_DEPTH")
        .unwrap_or_else(|_| MAX_PATH_DEPTH.to_string())
        .parse()
        .unwrap_or(MAX_PATH_DEPTH);

    let bridge_dispatch = std::env::var("REVFLOW_BRIDGE_DISPATCH")
        .ok()
        .filter(|v| v.parse::<DispatchMode>().is_ok())
        .unwrap_or_else(|| "direct".to_string());

    // Transport settings
    let frame_max_bytes = std::env::var("REVFLOW_FRAME_MAX_BYTES")
        .unwrap_or_else(|_| DEFAULT_MAX_FRAME.to_string())
        .parse()
        .unwrap_or(DEFAULT_MAX_FRAME);

    Ok(Config {
        node_id,
        debug,
        bridge_max_depth,
        bridge_dispatch,
        frame_max_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns distinct variables; tests run on parallel threads.

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.node_id, "node-1");
        assert_eq!(cfg.bridge_max_depth, 16);
        assert_eq!(cfg.bridge_dispatch, "direct");
        assert_eq!(cfg.frame_max_bytes, 16 * 1024 * 1024);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_default_bridge_config() {
        let bridge = Config::default().bridge_config().unwrap();
        assert_eq!(bridge.max_depth, MAX_PATH_DEPTH);
        assert_eq!(bridge.dispatch, DispatchMode::Direct);
        assert_eq!(bridge.worker_name, "revflow-bridge-node-1");
    }

    #[test]
    fn test_load_config_with_node_id() {
        std::env::set_var("REVFLOW_NODE_ID", "west-2");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.node_id, "west-2");
        std::env::remove_var("REVFLOW_NODE_ID");
    }

    #[test]
    fn test_load_config_with_worker_dispatch() {
        std::env::set_var("REVFLOW_BRIDGE_DISPATCH", "Worker");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.bridge_dispatch, "Worker");
        assert_eq!(cfg.bridge_config().unwrap().dispatch, DispatchMode::Worker);
        std::env::remove_var("REVFLOW_BRIDGE_DISPATCH");
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        std::env::set_var("REVFLOW_BRIDGE_MAX_DEPTH", "deep");
        std::env::set_var("REVFLOW_FRAME_MAX_BYTES", "-1");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.bridge_max_depth, MAX_PATH_DEPTH);
        assert_eq!(cfg.frame_max_bytes, DEFAULT_MAX_FRAME);
        std::env::remove_var("REVFLOW_BRIDGE_MAX_DEPTH");
        std::env::remove_var("REVFLOW_FRAME_MAX_BYTES");
    }

    #[test]
    fn test_bridge_config_rejects_zero_depth() {
        let cfg = Config {
            bridge_max_depth: 0,
            ..Config::default()
        };
        assert!(cfg.bridge_config().is_err());
    }

    #[test]
    fn test_bridge_config_rejects_unknown_dispatch() {
        let cfg = Config {
            bridge_dispatch: "threadpool".to_string(),
            ..Config::default()
        };
        let err = cfg.bridge_config().unwrap_err();
        assert!(err.to_string().contains("threadpool"));
    }
}
