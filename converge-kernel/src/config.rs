use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tokio::fs;
use tracing::warn;

use crate::dispatch::RetryPolicy;
use crate::models::StateMap;
use crate::schema;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub database: DatabaseConf,
    pub dispatch: DispatchConf,
    /// État du profil par défaut créé au premier accès d'une organisation
    pub default_state: StateMap,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Groupe `$share/<group>/...` : les instances se répartissent les événements
    pub share_group: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConf {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConf {
    pub max_attempts: u32,
    pub ack_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "converge-kernel".into(),
            keep_alive_secs: 30,
            share_group: "converge".into(),
        }
    }
}

impl Default for DatabaseConf {
    fn default() -> Self {
        Self { path: "converge.db".into() }
    }
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            ack_timeout_secs: 300,
            sweep_interval_secs: 15,
            backoff_base_secs: 30,
            backoff_max_secs: 1800,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http: HttpConf::default(),
            mqtt: MqttConf::default(),
            database: DatabaseConf::default(),
            dispatch: DispatchConf::default(),
            default_state: schema::FIELDS.iter().map(|f| (f.name.to_string(), true)).collect(),
        }
    }
}

impl DispatchConf {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl KernelConfig {
    /// Clés de `default_state` absentes du schéma (ignorées, signalées au boot)
    pub fn unknown_default_fields(&self) -> Vec<String> {
        self.default_state
            .keys()
            .filter(|k| !schema::is_known(k))
            .cloned()
            .collect()
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("CONVERGE_CONFIG").unwrap_or_else(|_| "converge.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!(%path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        })
    } else {
        warn!(%path, "config file not found, using defaults");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = parse_config("mqtt:\n  host: broker.local\ndispatch:\n  max_attempts: 2\n").unwrap();
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.dispatch.max_attempts, 2);
        assert_eq!(cfg.dispatch.ack_timeout_secs, 300);
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    }

    #[test]
    fn empty_file_is_default() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.database.path, "converge.db");
        assert_eq!(cfg.default_state.get("insights"), Some(&true));
    }

    #[test]
    fn unknown_default_fields_are_reported() {
        let cfg = parse_config("default_state:\n  insights: true\n  telemetry: false\n").unwrap();
        assert_eq!(cfg.unknown_default_fields(), vec!["telemetry".to_string()]);
        assert_eq!(cfg.default_state.len(), 2);
    }

    #[test]
    fn retry_policy_never_allows_zero_attempts() {
        let conf = DispatchConf { max_attempts: 0, ..DispatchConf::default() };
        assert_eq!(conf.retry_policy().max_attempts, 1);
    }
}
