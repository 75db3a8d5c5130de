//! Gateway configuration: listeners, Route Store driver selection, and the
//! process-wide resource caps from §5. Loaded once at startup and validated
//! eagerly — a bad config never gets far enough to bind a listener.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub route_store: RouteStoreConfig,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,

    #[serde(default = "default_pool_ceiling")]
    pub connection_pool_ceiling_per_backend: usize,

    #[serde(default = "default_pool_wait_ms")]
    pub connection_pool_wait_ms: u64,

    #[serde(default)]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsListenerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsListenerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum RouteStoreConfig {
    Memory,
    FileSnapshot {
        path: PathBuf,
        #[serde(default = "default_persist_interval_ms")]
        persist_interval_ms: u64,
    },
}

impl Default for RouteStoreConfig {
    fn default() -> Self {
        RouteStoreConfig::Memory
    }
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        host: "0.0.0.0".to_string(),
        port: 8080,
        tls: None,
    }]
}

fn default_max_in_flight() -> usize {
    10_000
}

fn default_pool_ceiling() -> usize {
    256
}

fn default_pool_wait_ms() -> u64 {
    1_000
}

fn default_persist_interval_ms() -> u64 {
    30_000
}

impl GatewayConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, String> {
        serde_yaml::from_str(raw).map_err(|e| format!("failed to parse gateway config: {e}"))
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config at {}: {e}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Eager startup validation: anything wrong here must fail before a
    /// listener is bound, per the exit-code-1 contract.
    pub fn validate(&self) -> Result<(), String> {
        if self.listeners.is_empty() {
            return Err("at least one listener is required".to_string());
        }
        for listener in &self.listeners {
            if listener.host.is_empty() {
                return Err("listener host must not be empty".to_string());
            }
            if let Some(tls) = &listener.tls {
                if !tls.cert_path.exists() {
                    return Err(format!("tls cert_path does not exist: {}", tls.cert_path.display()));
                }
                if !tls.key_path.exists() {
                    return Err(format!("tls key_path does not exist: {}", tls.key_path.display()));
                }
                if let Some(ca_path) = &tls.client_ca_path {
                    if !ca_path.exists() {
                        return Err(format!("tls client_ca_path does not exist: {}", ca_path.display()));
                    }
                }
            }
        }
        if self.max_in_flight_requests == 0 {
            return Err("max_in_flight_requests must be >= 1".to_string());
        }
        if self.connection_pool_ceiling_per_backend == 0 {
            return Err("connection_pool_ceiling_per_backend must be >= 1".to_string());
        }
        if let RouteStoreConfig::FileSnapshot { path, .. } = &self.route_store {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(format!(
                        "route store snapshot directory does not exist: {}",
                        parent.display()
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            route_store: RouteStoreConfig::default(),
            max_in_flight_requests: default_max_in_flight(),
            connection_pool_ceiling_per_backend: default_pool_ceiling(),
            connection_pool_wait_ms: default_pool_wait_ms(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_listeners_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.listeners.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_tls_cert_file_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.listeners[0].tls = Some(TlsListenerConfig {
            cert_path: PathBuf::from("/no/such/cert.pem"),
            key_path: PathBuf::from("/no/such/key.pem"),
            client_ca_path: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_file_snapshot_driver() {
        let raw = r#"
route_store:
  driver: file_snapshot
  path: /tmp/routes.yaml
  persist_interval_ms: 5000
"#;
        let cfg = GatewayConfig::from_yaml_str(raw).unwrap();
        match cfg.route_store {
            RouteStoreConfig::FileSnapshot { persist_interval_ms, .. } => {
                assert_eq!(persist_interval_ms, 5000);
            }
            _ => panic!("expected file_snapshot driver"),
        }
    }
}
