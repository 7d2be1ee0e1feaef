use crate::services::redundancy::{DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL};
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_timeout_seconds: u64,
    pub disable_ollama: bool,
    pub analysis_max_concurrent_jobs: usize,
    pub analysis_checkpoint_every: usize,
    pub analysis_retention_completed_seconds: u64,
    pub analysis_retention_failed_seconds: u64,
    pub analysis_retention_cancelled_seconds: u64,
    pub analysis_purge_interval_seconds: u64,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env_optional_string("CORE_DATABASE_URL")
            .map(normalize_database_url)
            .ok_or_else(|| anyhow::anyhow!("CORE_DATABASE_URL is required"))?;
        let database_max_connections =
            env_u32("CORE_DATABASE_MAX_CONNECTIONS", 10).clamp(1, 100);

        let ollama_url = env_string("CORE_OLLAMA_URL", DEFAULT_OLLAMA_URL);
        let ollama_model = env_string("CORE_OLLAMA_MODEL", DEFAULT_OLLAMA_MODEL);
        let ollama_timeout_seconds = env_u64("CORE_OLLAMA_TIMEOUT_SECONDS", 120).clamp(5, 900);
        let disable_ollama = env_bool("CORE_DISABLE_OLLAMA", false);

        let analysis_max_concurrent_jobs =
            env_u64("CORE_ANALYSIS_MAX_CONCURRENT_JOBS", 2).clamp(1, 16) as usize;
        let analysis_checkpoint_every =
            env_u64("CORE_ANALYSIS_CHECKPOINT_EVERY", 10).clamp(1, 1000) as usize;
        let analysis_retention_completed_seconds =
            env_u64("CORE_ANALYSIS_RETENTION_COMPLETED_SECONDS", 30 * 60).clamp(10, 24 * 3600);
        let analysis_retention_failed_seconds =
            env_u64("CORE_ANALYSIS_RETENTION_FAILED_SECONDS", 5 * 60).clamp(10, 24 * 3600);
        let analysis_retention_cancelled_seconds =
            env_u64("CORE_ANALYSIS_RETENTION_CANCELLED_SECONDS", 60).clamp(10, 24 * 3600);
        let analysis_purge_interval_seconds =
            env_u64("CORE_ANALYSIS_PURGE_INTERVAL_SECONDS", 60).clamp(5, 3600);

        Ok(Self {
            database_url,
            database_max_connections,
            ollama_url,
            ollama_model,
            ollama_timeout_seconds,
            disable_ollama,
            analysis_max_concurrent_jobs,
            analysis_checkpoint_every,
            analysis_retention_completed_seconds,
            analysis_retention_failed_seconds,
            analysis_retention_cancelled_seconds,
            analysis_purge_interval_seconds,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    parse_bool(std::env::var(key).ok().as_deref()).unwrap_or(default)
}

fn parse_bool(value: Option<&str>) -> Option<bool> {
    match value.map(|value| value.trim().to_lowercase()) {
        Some(value) if value == "1" || value == "true" || value == "yes" => Some(true),
        Some(value) if value == "0" || value == "false" || value == "no" => Some(false),
        _ => None,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgres://") {
        return format!("postgresql://{stripped}");
    }
    url
}
