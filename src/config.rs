use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::hashing::HashAlg;
use crate::pipeline::sampling::Sampling;
use crate::scanner::{DEFAULT_MAX_DEPTH, ScannerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub run_id: String,
    pub page_size: u64,
    pub margin: u64,
    pub threads: usize,
    pub max_depth: u32,
    pub hash_alg: HashAlg,
    pub sampling: Option<String>,
    pub sampling_seed: Option<u64>,
    pub offset_start: u64,
    pub offset_end: u64,
    pub page_start: u64,
    pub notify_rate: u64,
    pub max_alloc_retries: u32,
    pub alloc_retry_interval_ms: u64,
    pub drain_poll_interval_ms: u64,
    pub max_drain_wait_secs: u64,
    pub allow_list: Option<PathBuf>,
    pub deny_list: Option<PathBuf>,
    pub scanner_settings: BTreeMap<String, serde_yaml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            page_size: 16 * 1024 * 1024,
            margin: 4 * 1024 * 1024,
            threads: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            hash_alg: HashAlg::Md5,
            sampling: None,
            sampling_seed: None,
            offset_start: 0,
            offset_end: 0,
            page_start: 0,
            notify_rate: 4,
            max_alloc_retries: 60,
            alloc_retry_interval_ms: 60_000,
            drain_poll_interval_ms: 100,
            max_drain_wait_secs: 3600,
            allow_list: None,
            deny_list: None,
            scanner_settings: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be positive".to_string()));
        }
        if self.offset_start % self.page_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "offset_start {} is not a multiple of the page size {}",
                self.offset_start, self.page_size
            )));
        }
        if self.offset_end % self.page_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "offset_end {} is not a multiple of the page size {}",
                self.offset_end, self.page_size
            )));
        }
        if self.offset_end != 0 && self.offset_end <= self.offset_start {
            return Err(ConfigError::Invalid(
                "offset_end must be after offset_start".to_string(),
            ));
        }
        if self.notify_rate == 0 {
            return Err(ConfigError::Invalid("notify_rate must be positive".to_string()));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "drain_poll_interval_ms must be positive".to_string(),
            ));
        }
        self.sampling()?;
        Ok(())
    }

    pub fn sampling(&self) -> Result<Option<Sampling>, ConfigError> {
        match &self.sampling {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e: crate::pipeline::sampling::SamplingError| {
                    ConfigError::Invalid(e.to_string())
                }),
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    /// Scanner tunables as a flat string store.
    pub fn scanner_config(&self) -> ScannerConfig {
        let mut store = ScannerConfig::new();
        for (name, value) in &self.scanner_settings {
            let text = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => continue,
                other => serde_yaml::to_string(other)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default(),
            };
            store.set(name, &text);
        }
        store
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.run_id.trim().is_empty() {
        config.run_id = generate_run_id();
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), rand_suffix())
}

fn rand_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_loads_and_validates() {
        let loaded = load_config(None).expect("load");
        let cfg = &loaded.config;
        assert_eq!(cfg.page_size, 16 * 1024 * 1024);
        assert_eq!(cfg.margin, 4 * 1024 * 1024);
        assert_eq!(cfg.hash_alg, HashAlg::Md5);
        assert!(!cfg.run_id.is_empty());
        assert_eq!(loaded.config_hash.len(), 64);
        cfg.validate().expect("valid");

        let scanner_cfg = cfg.scanner_config();
        assert_eq!(scanner_cfg.get("zip_name_len_max", 0usize), 1024);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cfg.yml");
        std::fs::write(&path, "page_size: 4096\nhash_alg: sha256\n").unwrap();
        let cfg = load_config(Some(&path)).expect("load").config;
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.hash_alg, HashAlg::Sha256);
        assert_eq!(cfg.notify_rate, 4);
    }

    #[test]
    fn unknown_hash_algorithm_fails_to_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cfg.yml");
        std::fs::write(&path, "hash_alg: crc32\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn offsets_must_align_to_pages() {
        let cfg = Config {
            page_size: 4096,
            offset_start: 100,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            page_size: 4096,
            offset_start: 8192,
            offset_end: 4096,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_sampling_is_rejected() {
        let cfg = Config {
            sampling: Some("1.5".to_string()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
