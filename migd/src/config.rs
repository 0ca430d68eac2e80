use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{DEFAULT_CONTROL_PORT, DEFAULT_REGISTRATION_PORT, DEFAULT_TRANSFER_PORT};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // ip:port agents register on
    pub registration_addr: String,
    // ip:port of the HTTP control API
    pub http_addr: String,
    /// Node label steering the deployment's scheduling, `key:value`.
    pub label: String,
    pub cluster: ClusterConfig,
    pub migration: MigrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registration_addr: format!("0.0.0.0:{DEFAULT_REGISTRATION_PORT}"),
            http_addr: "0.0.0.0:8080".to_string(),
            label: "mig-ready:true".to_string(),
            cluster: ClusterConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub api_server: String,
    pub namespace: String,
    /// Bearer token file; the in-cluster service account token by default.
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    pub request_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            namespace: "mig-ready".to_string(),
            token_file: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            ca_file: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            insecure_skip_tls_verify: false,
            request_timeout_secs: 10,
        }
    }
}

impl ClusterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// How long to wait for the new replica's agent to register.
    pub registration_timeout_secs: u64,
    /// How long the origin agent may take to push every layer.
    pub push_timeout_secs: u64,
    pub agent_control_port: u16,
    pub transfer_port: u16,
    pub connect_timeout_secs: u64,
    /// Read timeout for a single registration or control frame.
    pub frame_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            registration_timeout_secs: 120,
            push_timeout_secs: 600,
            agent_control_port: DEFAULT_CONTROL_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            connect_timeout_secs: 5,
            frame_timeout_secs: 10,
        }
    }
}

impl MigrationConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
