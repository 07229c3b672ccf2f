//! Bootstrap job definitions from the `SCRAPER_JOBS` environment variable.
//!
//! The variable holds a JSON array of job objects. Invalid entries are
//! skipped with a log line; a malformed array yields no jobs at all.

use serde::Deserialize;
use tracing::{error, warn};

use crate::store::{JobParams, job::MIN_INTERVAL_SECONDS};

#[derive(Debug, Clone)]
pub struct BootstrapJob {
    pub name: String,
    pub interval_seconds: i64,
    pub params: JobParams,
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
struct RawJobConfig {
    name: Option<String>,
    query: Option<String>,
    location: Option<String>,
    radius: Option<i64>,
    min_price: Option<i64>,
    max_price: Option<i64>,
    #[serde(default)]
    page_count: Option<i64>,
    interval_seconds: Option<i64>,
    /// Accepted alias for `interval_seconds`.
    interval: Option<i64>,
    is_active: Option<bool>,
}

/// Parse the raw JSON array leniently.
pub fn parse_job_configs(raw: &str, default_interval_seconds: i64) -> Vec<BootstrapJob> {
    let parsed: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to parse SCRAPER_JOBS configuration: {e}");
            return Vec::new();
        }
    };
    let Some(items) = parsed.as_array() else {
        error!("SCRAPER_JOBS must be a list of job definitions");
        return Vec::new();
    };

    let mut jobs = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let raw_config: RawJobConfig = match serde_json::from_value(item.clone()) {
            Ok(config) => config,
            Err(e) => {
                warn!(index, "Ignoring invalid job definition: {e}");
                continue;
            }
        };

        let name = raw_config
            .name
            .or_else(|| raw_config.query.clone())
            .unwrap_or_else(|| format!("job-{index}"));

        // The registry enforces a 60 s floor; sub-minimum values fall back
        // to the default instead of failing job creation later.
        let interval_seconds = raw_config
            .interval_seconds
            .or(raw_config.interval)
            .filter(|&interval| interval >= MIN_INTERVAL_SECONDS)
            .unwrap_or_else(|| {
                warn!(job = %name, "Missing or invalid interval; using default");
                default_interval_seconds
            });

        jobs.push(BootstrapJob {
            name,
            interval_seconds,
            params: JobParams {
                query: raw_config.query,
                location: raw_config.location,
                radius: raw_config.radius,
                min_price: raw_config.min_price,
                max_price: raw_config.max_price,
                page_count: raw_config.page_count.unwrap_or(1).max(1),
            },
            is_active: raw_config.is_active.unwrap_or(true),
        });
    }

    jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_job() {
        let jobs = parse_job_configs(
            r#"[{"name":"woom","query":"Woom 3","interval_seconds":60}]"#,
            3600,
        );
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "woom");
        assert_eq!(jobs[0].interval_seconds, 60);
        assert_eq!(jobs[0].params.query.as_deref(), Some("Woom 3"));
        assert!(jobs[0].is_active);
        assert_eq!(jobs[0].params.page_count, 1);
    }

    #[test]
    fn name_falls_back_to_query_then_index() {
        let jobs = parse_job_configs(r#"[{"query":"bikes"},{}]"#, 900);
        assert_eq!(jobs[0].name, "bikes");
        assert_eq!(jobs[1].name, "job-1");
        assert_eq!(jobs[0].interval_seconds, 900);
    }

    #[test]
    fn interval_alias_and_invalid_values() {
        let jobs = parse_job_configs(r#"[{"name":"a","interval":120},{"name":"b","interval_seconds":-5}]"#, 600);
        assert_eq!(jobs[0].interval_seconds, 120);
        assert_eq!(jobs[1].interval_seconds, 600);
    }

    #[test]
    fn sub_minimum_intervals_fall_back_to_the_default() {
        // 30 s is positive but below the registry's 60 s floor; the job must
        // still run, on the default interval, rather than fail creation.
        let jobs = parse_job_configs(r#"[{"name":"fast","interval_seconds":30}]"#, 900);
        assert_eq!(jobs[0].interval_seconds, 900);

        // The floor itself is accepted unchanged.
        let jobs = parse_job_configs(r#"[{"name":"edge","interval_seconds":60}]"#, 900);
        assert_eq!(jobs[0].interval_seconds, 60);
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let jobs = parse_job_configs(r#"[{"name":"ok"},42,"nope"]"#, 600);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "ok");
    }

    #[test]
    fn malformed_json_yields_no_jobs() {
        assert!(parse_job_configs("not json", 600).is_empty());
        assert!(parse_job_configs(r#"{"name":"obj"}"#, 600).is_empty());
    }
}
