use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gcs: GcsConfig,
    #[serde(default)]
    pub transports: Vec<TransportConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_topic_root")]
    pub root: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_topic_root() -> String {
    "wayfarer/v1".to_string()
}
fn default_client_id() -> String {
    "wayfarer-bridge".to_string()
}
fn default_keep_alive() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct GcsConfig {
    #[serde(default = "default_gcs_sysid")]
    pub sysid: u8,
    #[serde(default = "default_gcs_compid")]
    pub compid: u8,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: f64,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            sysid: default_gcs_sysid(),
            compid: default_gcs_compid(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

fn default_gcs_sysid() -> u8 {
    250
}
fn default_gcs_compid() -> u8 {
    1
}
fn default_heartbeat_interval() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    UdpListen,
    UdpConnect,
    Serial,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    pub name: String,
    pub kind: TransportKind,
    /// `host:port` for UDP, device path (e.g. `/dev/ttyUSB0`) for serial.
    pub endpoint: String,
    pub baud: Option<u32>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// `"any"` or a transport name.
    pub from: String,
    pub to: Vec<RouteTarget>,
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_s: f64,
}

fn default_dedupe_window() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum RouteTarget {
    Udp { udp: String },
    Port { to_port: String },
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("failed to read config file: {}", path))?;

        let mut config: Config =
            toml::from_str(&contents).context("failed to parse config file")?;

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOUSTON_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("HOUSTON_MQTT_PORT") {
            if let Ok(port) = port.parse() {
                self.mqtt.port = port;
            }
        }
        if let Ok(root) = std::env::var("HOUSTON_TOPIC_PREFIX") {
            self.mqtt.root = root;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.port == 0 {
            anyhow::bail!("mqtt.port must be greater than 0");
        }
        if self.mqtt.root.is_empty() {
            anyhow::bail!("mqtt.root must not be empty");
        }

        let mut seen_names = HashMap::new();
        for (idx, t) in self.transports.iter().enumerate() {
            if t.name.is_empty() {
                anyhow::bail!("transport {} has an empty name", idx);
            }
            if let Some(prev) = seen_names.insert(t.name.clone(), idx) {
                anyhow::bail!(
                    "transport {} duplicates the name of transport {} ('{}')",
                    idx,
                    prev,
                    t.name
                );
            }
            if t.kind == TransportKind::Serial && t.baud.is_none() {
                anyhow::bail!("transport '{}' is serial but has no baud configured", t.name);
            }
            if t.queue_capacity == 0 {
                anyhow::bail!("transport '{}' queue_capacity must be greater than 0", t.name);
            }
        }

        for (idx, r) in self.routes.iter().enumerate() {
            if r.from != "any" && !seen_names.contains_key(&r.from) {
                anyhow::bail!(
                    "route {} has from='{}' which is not a configured transport",
                    idx,
                    r.from
                );
            }
            for target in &r.to {
                if let RouteTarget::Port { to_port } = target {
                    if !seen_names.contains_key(to_port) {
                        anyhow::bail!(
                            "route {} forwards to_port='{}' which is not a configured transport",
                            idx,
                            to_port
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> &'static str {
        r#"
            [mqtt]
            host = "localhost"
            port = 1883
            root = "wayfarer/v1"

            [[transports]]
            name = "udp_14550"
            kind = "udp_listen"
            endpoint = "0.0.0.0:14550"
        "#
    }

    #[test]
    fn parses_minimal_config() {
        let config: Config = toml::from_str(base_toml()).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.transports.len(), 1);
        assert_eq!(config.gcs.sysid, 250);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_serial_without_baud() {
        let toml_src = r#"
            [mqtt]
            host = "localhost"

            [[transports]]
            name = "fc0"
            kind = "serial"
            endpoint = "/dev/ttyUSB0"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_route_to_unknown_transport() {
        let toml_src = r#"
            [mqtt]
            host = "localhost"

            [[transports]]
            name = "udp_14550"
            kind = "udp_listen"
            endpoint = "0.0.0.0:14550"

            [[routes]]
            from = "any"
            to = [{ to_port = "nope" }]
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!(config.validate().is_err());
    }
}
