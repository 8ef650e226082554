//! Configuration management for the tessera node
//!
//! Configuration comes from a `config.yaml` found next to the executable
//! (or up to three parent directories above it, covering development,
//! testing, and deployed layouts), with every section falling back to
//! defaults so a node always starts. An explicit `--config` path skips the
//! search.
//!
//! ## Sections
//!
//! - `node`: data directory, optional fixed peer id, developer mode
//! - `cluster`: consensus parameters: cluster size, majority thresholds,
//!   downsize tolerance, and the absolute minimum cluster size enforced
//!   before a consensus round opens
//! - `retry`: straggler retry backoff (initial/max interval, factor,
//!   attempt cap)
//! - `rpc`: the deadline applied to every remote call
//! - `development`: auto-exit duration for test runs
//!
//! Parse errors are logged and defaults used; configuration problems must
//! not keep a peer down.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{debug, error};

use crate::cluster::{ConsensusConfig, RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub development: DevelopmentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default = "default_developer_mode")]
    pub developer_mode: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,
    #[serde(default = "default_super_majority_threshold")]
    pub super_majority_threshold: f64,
    #[serde(default = "default_simple_majority_threshold")]
    pub simple_majority_threshold: f64,
    #[serde(default)]
    pub allow_cluster_downsize: bool,
    #[serde(default = "default_cluster_size_tolerance")]
    pub cluster_size_tolerance: f64,
    /// Defaults to 1 in developer mode, 3 otherwise (see
    /// `Config::min_absolute_cluster_size`)
    #[serde(default)]
    pub min_absolute_cluster_size: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_retry_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DevelopmentConfig {
    #[serde(default)]
    pub default_duration: Option<u64>,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_developer_mode() -> bool {
    true
}

fn default_cluster_size() -> usize {
    3
}

fn default_super_majority_threshold() -> f64 {
    2.0 / 3.0
}

fn default_simple_majority_threshold() -> f64 {
    0.5
}

fn default_cluster_size_tolerance() -> f64 {
    0.25
}

fn default_retry_initial_interval_ms() -> u64 {
    2000
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_retry_max_interval_ms() -> u64 {
    30000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_rpc_timeout_ms() -> u64 {
    10000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig::default(),
            cluster: ClusterConfig::default(),
            retry: RetryConfig::default(),
            rpc: RpcConfig::default(),
            development: DevelopmentConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: default_data_dir(),
            peer_id: None,
            developer_mode: default_developer_mode(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            cluster_size: default_cluster_size(),
            super_majority_threshold: default_super_majority_threshold(),
            simple_majority_threshold: default_simple_majority_threshold(),
            allow_cluster_downsize: false,
            cluster_size_tolerance: default_cluster_size_tolerance(),
            min_absolute_cluster_size: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_interval_ms: default_retry_initial_interval_ms(),
            backoff_factor: default_retry_backoff_factor(),
            max_interval_ms: default_retry_max_interval_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig { timeout_ms: default_rpc_timeout_ms() }
    }
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        DevelopmentConfig { default_duration: None }
    }
}

impl Config {
    /// Effective minimum cluster size: 1 in developer mode, 3 otherwise,
    /// unless pinned in the config file
    pub fn min_absolute_cluster_size(&self) -> usize {
        self.cluster
            .min_absolute_cluster_size
            .unwrap_or(if self.node.developer_mode { 1 } else { 3 })
    }

    /// The consensus parameters the cluster coordinator consumes
    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            super_majority_threshold: self.cluster.super_majority_threshold,
            simple_majority_threshold: self.cluster.simple_majority_threshold,
            suggested_cluster_size: self.cluster.cluster_size,
            min_absolute_cluster_size: self.min_absolute_cluster_size(),
            allow_cluster_downsize: self.cluster.allow_cluster_downsize,
            cluster_size_tolerance: self.cluster.cluster_size_tolerance,
            developer_mode: self.node.developer_mode,
            rpc_timeout: Duration::from_millis(self.rpc.timeout_ms),
        }
    }

    /// The straggler retry policy the cluster coordinator consumes
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            backoff_factor: self.retry.backoff_factor,
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            max_attempts: self.retry.max_attempts,
        }
    }
}

/// Load configuration from an explicit path, or search near the executable
pub fn load_config(config_path: Option<String>) -> Config {
    if let Some(path) = config_path {
        return load_config_file(Path::new(&path)).unwrap_or_else(|| {
            error!("Could not load config from {path}, using defaults");
            Config::default()
        });
    }

    // Determine the executable directory
    let exe_path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    let exe_dir = exe_path.parent().unwrap_or_else(|| Path::new("."));

    // Try config.yaml here and in up to 3 parent directories
    let mut search_dir = PathBuf::from(exe_dir);
    for _ in 0..=3 {
        let candidate = search_dir.join("config.yaml");
        if candidate.exists() {
            if let Some(config) = load_config_file(&candidate) {
                return config;
            }
        }
        search_dir = match search_dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => break,
        };
    }

    debug!("📄 Using default configuration");
    Config::default()
}

fn load_config_file(path: &Path) -> Option<Config> {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str(&contents) {
            Ok(config) => {
                debug!("📄 Loaded configuration from {:?}", path);
                Some(config)
            }
            Err(e) => {
                error!("Error parsing {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            error!("Error reading {:?}: {}", path, e);
            None
        }
    }
}
