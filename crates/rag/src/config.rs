use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use minirag_llm::LlmProvider;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RagError, Result};

pub const DEFAULT_REQUESTS_PER_MINUTE: u64 = 30;
pub const DEFAULT_TOKENS_PER_MINUTE: u64 = 6_000;
pub const DEFAULT_REQUESTS_PER_DAY: u64 = 14_400;
pub const DEFAULT_TOKENS_PER_DAY: u64 = 500_000;

const DEFAULT_CONFIG_FILE: &str = "minirag.toml";

/// Quota ceilings for both counting windows. Fixed for the process lifetime.
/// Ceilings left out of a `[quota]` table keep their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub requests_per_day: u64,
    pub tokens_per_day: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            tokens_per_minute: DEFAULT_TOKENS_PER_MINUTE,
            requests_per_day: DEFAULT_REQUESTS_PER_DAY,
            tokens_per_day: DEFAULT_TOKENS_PER_DAY,
        }
    }
}

impl QuotaLimits {
    pub fn from_env() -> Self {
        Self::default().overlay(&|key| env::var(key).ok())
    }

    fn overlay(self, lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            requests_per_minute: parse_var(lookup, "QUOTA_REQUESTS_PER_MINUTE")
                .unwrap_or(self.requests_per_minute),
            tokens_per_minute: parse_var(lookup, "QUOTA_TOKENS_PER_MINUTE")
                .unwrap_or(self.tokens_per_minute),
            requests_per_day: parse_var(lookup, "QUOTA_REQUESTS_PER_DAY")
                .unwrap_or(self.requests_per_day),
            tokens_per_day: parse_var(lookup, "QUOTA_TOKENS_PER_DAY")
                .unwrap_or(self.tokens_per_day),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub index_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub provider: LlmProvider,
    pub model: String,
    pub quota: QuotaLimits,
    pub bind_addr: String,
}

/// Optional on-disk configuration; every field may be overridden from the
/// environment.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub db_path: Option<PathBuf>,
    pub index_dir: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub quota: Option<QuotaLimits>,
}

impl AppConfig {
    /// Reads `MINIRAG_CONFIG` (default `minirag.toml`) if present, then
    /// applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = env::var("MINIRAG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let file = load_file_config(path)?;
        Self::from_sources(file, &|key| env::var(key).ok())
    }

    pub fn from_env() -> Result<Self> {
        Self::from_sources(FileConfig::default(), &|key| env::var(key).ok())
    }

    pub fn from_map(file: FileConfig, vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_sources(file, &|key| vars.get(key).cloned())
    }

    fn from_sources(file: FileConfig, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let provider_name = lookup("MINIRAG_PROVIDER")
            .or(file.provider)
            .unwrap_or_else(|| "groq".to_string());
        let provider = LlmProvider::from_name(&provider_name)
            .ok_or_else(|| RagError::Config(format!("unknown provider {provider_name}")))?;
        let model = lookup("MINIRAG_MODEL")
            .or(file.model)
            .unwrap_or_else(|| provider.default_model().to_string());
        let chunk_size = parse_var(lookup, "MINIRAG_CHUNK_SIZE")
            .or(file.chunk_size)
            .unwrap_or(500);
        let chunk_overlap = parse_var(lookup, "MINIRAG_CHUNK_OVERLAP")
            .or(file.chunk_overlap)
            .unwrap_or(100);
        if chunk_size == 0 {
            return Err(RagError::Config("chunk size must be positive".to_string()));
        }
        Ok(Self {
            db_path: lookup("MINIRAG_DB")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| PathBuf::from("minirag.sqlite")),
            index_dir: lookup("MINIRAG_INDEX_DIR")
                .map(PathBuf::from)
                .or(file.index_dir)
                .unwrap_or_else(|| PathBuf::from("faiss_indices")),
            chunk_size,
            chunk_overlap,
            top_k: parse_var(lookup, "MINIRAG_TOP_K")
                .or(file.top_k)
                .unwrap_or(4),
            provider,
            model,
            quota: file.quota.unwrap_or_default().overlay(lookup),
            bind_addr: lookup("BIND_ADDR")
                .or(file.bind_addr)
                .unwrap_or_else(|| "0.0.0.0:5000".to_string()),
        })
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| RagError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| RagError::Config(format!("invalid {}: {e}", path.display())))
}

fn parse_var<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = AppConfig::from_map(FileConfig::default(), &HashMap::new()).unwrap();
        assert_eq!(config.quota, QuotaLimits::default());
        assert_eq!(config.quota.requests_per_minute, 30);
        assert_eq!(config.quota.tokens_per_day, 500_000);
        assert_eq!(config.provider, LlmProvider::Groq);
        assert_eq!(config.model, "llama3-70b-8192");
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.chunk_overlap, 100);
        assert_eq!(config.index_dir, PathBuf::from("faiss_indices"));
    }

    #[test]
    fn environment_overrides_file_and_bad_values_fall_back() {
        let file: FileConfig = toml::from_str(
            r#"
            provider = "local"
            top_k = 8
            [quota]
            requests_per_minute = 10
            tokens_per_minute = 1000
            requests_per_day = 100
            tokens_per_day = 10000
            "#,
        )
        .unwrap();
        let config = AppConfig::from_map(
            file,
            &vars(&[
                ("QUOTA_TOKENS_PER_MINUTE", "2500"),
                ("QUOTA_REQUESTS_PER_DAY", "lots"),
                ("MINIRAG_TOP_K", "2"),
            ]),
        )
        .unwrap();
        assert_eq!(config.provider, LlmProvider::Local);
        assert_eq!(config.top_k, 2);
        assert_eq!(config.quota.requests_per_minute, 10);
        assert_eq!(config.quota.tokens_per_minute, 2500);
        assert_eq!(config.quota.requests_per_day, 100);
    }

    #[test]
    fn partial_quota_table_keeps_other_defaults() {
        let file: FileConfig = toml::from_str("[quota]\nrequests_per_minute = 10\n").unwrap();
        let config = AppConfig::from_map(file, &HashMap::new()).unwrap();
        assert_eq!(
            config.quota,
            QuotaLimits {
                requests_per_minute: 10,
                ..QuotaLimits::default()
            }
        );
        assert_eq!(config.quota.tokens_per_minute, DEFAULT_TOKENS_PER_MINUTE);
        assert_eq!(config.quota.tokens_per_day, DEFAULT_TOKENS_PER_DAY);
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let err = AppConfig::from_map(
            FileConfig::default(),
            &vars(&[("MINIRAG_PROVIDER", "carrier-pigeon")]),
        )
        .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_file_config(&dir.path().join("absent.toml")).unwrap();
        assert!(file.provider.is_none());
    }
}
