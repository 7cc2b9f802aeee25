use std::{env, fs, net::SocketAddr, path::PathBuf};

use anyhow::Result;
use uuid::Uuid;

use crate::pipeline::PipelineOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub store_path: PathBuf,
    pub namespace: String,
    pub short_name_len: usize,
    pub queue_capacity: usize,
    pub job_retention_seconds: u64,
    pub cache_fanout_warn: usize,
    pub max_body_bytes: usize,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("MODEL_IMPORT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_addr = parse_bind_addr(&bind_raw);

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let store_path = PathBuf::from(
            env::var("MODEL_IMPORT_STORE_PATH")
                .unwrap_or_else(|_| "/data/model-import/items.sqlite".to_string()),
        );

        let namespace = env::var("MODEL_IMPORT_NAMESPACE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "default".to_string());

        let short_name_len = env_parsed("MODEL_IMPORT_SHORT_NAME_LEN", 11usize).max(1);
        let queue_capacity = env_parsed("MODEL_IMPORT_QUEUE_CAPACITY", 128usize).max(1);
        let job_retention_seconds =
            env_parsed("MODEL_IMPORT_JOB_RETENTION_SECONDS", 24 * 60 * 60u64);
        let cache_fanout_warn = env_parsed("MODEL_IMPORT_CACHE_FANOUT_WARN", 50usize);
        let max_body_bytes = env_parsed("MODEL_IMPORT_MAX_BODY_BYTES", 512 * 1024 * 1024usize);

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            store_path,
            namespace,
            short_name_len,
            queue_capacity,
            job_retention_seconds,
            cache_fanout_warn,
            max_body_bytes,
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            short_name_len: self.short_name_len,
            namespace: self.namespace.clone(),
            cache_fanout_warn: self.cache_fanout_warn,
        }
    }
}

fn parse_bind_addr(raw: &str) -> SocketAddr {
    raw.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .parse::<SocketAddr>()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("MODEL_IMPORT_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("MODEL_IMPORT_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[model-import-api] MODEL_IMPORT_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[model-import-api] Failed reading MODEL_IMPORT_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!("[model-import-api] MODEL_IMPORT_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}
