//! Process configuration sourced from environment variables.
//!
//! Everything is constructed once in `main` and passed by reference; no
//! process-wide globals. Component-specific tunables live next to their
//! components (`ContextPoolConfig`, `PipelineConfig`, `AnalysisConfig`);
//! this module only assembles them from the environment.

use crate::analyzer::AnalysisConfig;
use crate::browser::ContextPoolConfig;
use crate::scrape::PipelineConfig;

/// Default scheduler interval when a bootstrap job omits one (seconds).
pub const DEFAULT_INTERVAL_SECONDS: u64 = 3600;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. `sqlite://adscout.sqlite3`.
    pub database_url: String,
    /// Log every SQL statement at debug level.
    pub database_echo: bool,
    /// Raw `SCRAPER_JOBS` JSON array, parsed lazily by the scheduler.
    pub scraper_jobs: Option<String>,
    /// Fallback interval for bootstrap jobs without one.
    pub default_interval_seconds: u64,
    pub pool: ContextPoolConfig,
    pub pipeline: PipelineConfig,
    pub analysis: AnalysisConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://adscout.sqlite3".to_string(),
            database_echo: false,
            scraper_jobs: None,
            default_interval_seconds: DEFAULT_INTERVAL_SECONDS,
            pool: ContextPoolConfig::default(),
            pipeline: PipelineConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    ///
    /// Loads a `.env` file when present. Unparseable numeric values fall
    /// back to their defaults with a log line rather than aborting startup.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.trim().is_empty()
        {
            config.database_url = url;
        }
        config.database_echo = env_flag("DATABASE_ECHO");
        config.scraper_jobs = std::env::var("SCRAPER_JOBS")
            .ok()
            .filter(|s| !s.trim().is_empty());
        config.default_interval_seconds =
            env_u64("SCRAPER_INTERVAL_SECONDS", DEFAULT_INTERVAL_SECONDS).max(1);

        config.pool.max_contexts = env_usize("BROWSER_MAX_CONTEXTS", config.pool.max_contexts);
        config.pool.max_concurrent = env_usize("BROWSER_MAX_CONCURRENT", config.pool.max_concurrent);
        config.pool.headless = !env_flag("BROWSER_HEADED");

        config.pipeline.retry_count = env_u32("SCRAPER_RETRY_COUNT", config.pipeline.retry_count);
        config.pipeline.max_detail_workers =
            env_usize("SCRAPER_DETAIL_WORKERS", config.pipeline.max_detail_workers);

        config.analysis.phash_threshold =
            env_u32("ANALYSIS_PHASH_THRESHOLD", config.analysis.phash_threshold);
        config.analysis.parallel_downloads =
            env_usize("ANALYSIS_PARALLEL_DOWNLOADS", config.analysis.parallel_downloads);
        config.analysis.max_image_bytes =
            env_usize("ANALYSIS_MAX_IMAGE_BYTES", config.analysis.max_image_bytes);

        config
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn env_u64(name: &str, default: u64) -> u64 {
    parse_env(name, default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    parse_env(name, default)
}

fn env_usize(name: &str, default: usize) -> usize {
    parse_env(name, default)
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.default_interval_seconds, 3600);
        assert!(config.pool.headless);
        assert!(config.database_url.starts_with("sqlite://"));
    }
}
