// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<IcehouseConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static IcehouseConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = IcehouseConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static IcehouseConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env_or_default() {
        Ok(path) => IcehouseConfig::load_from_file(&path)?,
        Err(_) => IcehouseConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static IcehouseConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("ICEHOUSE_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("icehouse.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $ICEHOUSE_CONFIG or create ./icehouse.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct IcehouseConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "icehouse=debug,hyper=off,h2=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl IcehouseConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: IcehouseConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for IcehouseConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            server: ServerConfig::default(),
            optimizer: OptimizerConfig::default(),
            replication: ReplicationConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8123
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            http_port: default_http_port(),
        }
    }
}

/// Knobs of the eager-aggregation rewrite.
#[derive(Clone, Deserialize)]
pub struct OptimizerConfig {
    /// Minimum `child_rows / predicted_rows` ratio for a push to pay off.
    #[serde(default = "default_agg_push_down_threshold")]
    pub agg_push_down_threshold: f64,
    /// Damping applied to every group key past the leading one.
    #[serde(default = "default_multi_agg_keys_correlated_coefficient")]
    pub multi_agg_keys_correlated_coefficient: f64,
    #[serde(default)]
    pub only_push_agg_with_functions: bool,
    /// Stop the bottom-join search at the first join instead of descending.
    #[serde(default)]
    pub agg_push_down_every_join: bool,
    /// Comma-separated join ids where the rewrite is forbidden.
    #[serde(default)]
    pub eager_agg_join_id_blocklist: String,
    /// Comma-separated `joinid-childindex` pairs; non-empty list restricts
    /// the rewrite to exactly these targets.
    #[serde(default)]
    pub eager_agg_join_id_whitelist: String,
}

fn default_agg_push_down_threshold() -> f64 {
    10.0
}

fn default_multi_agg_keys_correlated_coefficient() -> f64 {
    0.3
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            agg_push_down_threshold: default_agg_push_down_threshold(),
            multi_agg_keys_correlated_coefficient: default_multi_agg_keys_correlated_coefficient(),
            only_push_agg_with_functions: false,
            agg_push_down_every_join: false,
            eager_agg_join_id_blocklist: String::new(),
            eager_agg_join_id_whitelist: String::new(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ReplicationConfig {
    /// 0 means unlimited.
    #[serde(default)]
    pub replicated_max_parallel_sends: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub replicated_max_parallel_sends_for_table: u32,
    /// Cap on pooled fetch connections per remote host. 0 means unlimited.
    #[serde(default)]
    pub replicated_max_parallel_fetches_for_host: u32,
    #[serde(default)]
    pub allow_remote_fs_zero_copy_replication: bool,
    #[serde(default = "default_min_compressed_bytes_to_fsync_after_fetch")]
    pub min_compressed_bytes_to_fsync_after_fetch: u64,
    #[serde(default)]
    pub fsync_part_directory: bool,
    /// 0 means unthrottled.
    #[serde(default)]
    pub max_replicated_send_bytes_per_sec: u64,
}

fn default_min_compressed_bytes_to_fsync_after_fetch() -> u64 {
    0
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replicated_max_parallel_sends: 0,
            replicated_max_parallel_sends_for_table: 0,
            replicated_max_parallel_fetches_for_host: 0,
            allow_remote_fs_zero_copy_replication: false,
            min_compressed_bytes_to_fsync_after_fetch:
                default_min_compressed_bytes_to_fsync_after_fetch(),
            fsync_part_directory: false,
            max_replicated_send_bytes_per_sec: 0,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    /// Local data directories, one disk per entry.
    #[serde(default)]
    pub data_dirs: Vec<String>,
    #[serde(default = "default_table_name")]
    pub table: String,
}

fn default_table_name() -> String {
    "default".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dirs: Vec::new(),
            table: default_table_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::IcehouseConfig;

    #[test]
    fn optimizer_defaults_apply_without_section() {
        let cfg: IcehouseConfig = toml::from_str(
            r#"
[server]
http_port = 8123
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.optimizer.agg_push_down_threshold, 10.0);
        assert_eq!(cfg.optimizer.multi_agg_keys_correlated_coefficient, 0.3);
        assert!(!cfg.optimizer.agg_push_down_every_join);
        assert!(cfg.optimizer.eager_agg_join_id_blocklist.is_empty());
    }

    #[test]
    fn replication_caps_can_be_overridden() {
        let cfg: IcehouseConfig = toml::from_str(
            r#"
[replication]
replicated_max_parallel_sends = 8
replicated_max_parallel_sends_for_table = 4
fsync_part_directory = true
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.replication.replicated_max_parallel_sends, 8);
        assert_eq!(cfg.replication.replicated_max_parallel_sends_for_table, 4);
        assert!(cfg.replication.fsync_part_directory);
        assert!(!cfg.replication.allow_remote_fs_zero_copy_replication);
    }
}
