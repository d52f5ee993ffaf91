use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub wal_flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    pub max_file_size_bytes: u64,
    pub warn_file_size_bytes: u64,
    pub archive_max_uncompressed_bytes: u64,
    pub archive_max_compression_ratio: u32,
    pub archive_max_nesting_depth: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 200 * 1024 * 1024,
            warn_file_size_bytes: 50 * 1024 * 1024,
            archive_max_uncompressed_bytes: 1024 * 1024 * 1024,
            archive_max_compression_ratio: 100,
            archive_max_nesting_depth: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    pub chunk_workers: usize,
    pub embed_workers: usize,
    pub channel_bound: usize,
    pub skip_summary_interval_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_workers: 1,
            embed_workers: 2,
            channel_bound: 64,
            skip_summary_interval_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub rrf_k: u32,
    pub rerank_top_n: usize,
    pub cache_max_entries: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            rerank_top_n: 50,
            cache_max_entries: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("RAGKB"));

        builder.build()?.try_deserialize()
    }
}
