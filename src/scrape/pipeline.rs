//! Two-phase scrape pipeline with retry, backoff, and partial-failure
//! accounting.
//!
//! Phase 1 fetches every requested results page through the pool's
//! concurrency gate. Phase 2 fetches details for the deduplicated union of
//! summaries with a bounded worker pool. Partial failures never fail the
//! run; they degrade records and attach structured warnings.

use anyhow::{Result, bail};
use futures::future::join_all;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::browser::{ContextPool, PoolMetrics};
use crate::source::{ListingDetail, ListingSource, ListingSummary, SearchQuery};

use super::errors::{ErrorSeverity, StructuredError, classify_error};
use super::geo::{PostalGazetteer, RadiusFilterStats, haversine_km};
use super::metrics::{PageTiming, PipelineMetrics};
use super::warnings::{ScrapeWarning, WarningSink};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum retries per page / detail fetch (on top of the first attempt).
    pub retry_count: u32,
    /// Requested detail-phase worker count, before resource capping.
    pub max_detail_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            max_detail_workers: 5,
        }
    }
}

/// One listing flowing out of the pipeline.
#[derive(Debug, Clone)]
pub struct ScrapedListing {
    pub summary: ListingSummary,
    pub detail: Option<ListingDetail>,
    /// Record-level annotations, e.g. why the detail is missing.
    pub warnings: Vec<String>,
    /// Distance from the search origin, set by the radius post-filter.
    pub distance_km: Option<f64>,
}

/// Success envelope of a pipeline run.
#[derive(Debug)]
pub struct ScrapeReport {
    pub success: bool,
    pub partial_success: bool,
    pub records: Vec<ScrapedListing>,
    pub warnings: Vec<ScrapeWarning>,
    pub performance_metrics: PipelineMetrics,
    pub browser_metrics: PoolMetrics,
    pub location_filter: Option<RadiusFilterStats>,
}

/// Effective detail-phase worker count.
///
/// Bounded by requested workers, free contexts, and the listing count, then
/// capped harder for tiny batches where extra workers only burn contexts.
pub fn detail_worker_count(requested: usize, available_contexts: usize, listing_count: usize) -> usize {
    let mut workers = requested.min(available_contexts).min(listing_count);
    if listing_count <= 3 {
        workers = workers.min(2);
    } else if listing_count <= 10 {
        workers = workers.min(3);
    }
    workers.max(1)
}

struct PageFetch {
    page: u32,
    timing: PageTiming,
    result: Result<Vec<ListingSummary>, StructuredError>,
}

pub struct ScrapePipeline {
    source: Arc<dyn ListingSource>,
    pool: Arc<ContextPool>,
    gazetteer: Arc<PostalGazetteer>,
    config: PipelineConfig,
}

impl ScrapePipeline {
    pub fn new(source: Arc<dyn ListingSource>, pool: Arc<ContextPool>, config: PipelineConfig) -> Self {
        Self {
            source,
            pool,
            gazetteer: Arc::new(PostalGazetteer::default()),
            config,
        }
    }

    /// Run both phases for one query.
    ///
    /// Returns `Err` only for invariant violations; partial failures come
    /// back inside the report.
    pub async fn run(&self, query: &SearchQuery) -> Result<ScrapeReport> {
        if query.page_count == 0 {
            bail!("page_count must be >= 1");
        }

        let started = Instant::now();
        let mut sink = WarningSink::new();
        let mut metrics = PipelineMetrics {
            pages_requested: query.page_count,
            ..Default::default()
        };

        // Phase 1: list pages.
        let page_fetches = join_all(
            (1..=query.page_count).map(|page| self.fetch_page_with_retry(query, page)),
        )
        .await;

        let mut summaries: Vec<ListingSummary> = Vec::new();
        for fetch in page_fetches {
            let retried = fetch.timing.retry_count;
            match fetch.result {
                Ok(results) => {
                    metrics.pages_successful += 1;
                    if retried > 0 {
                        sink.add(
                            format!("Page {} succeeded after {} retries", fetch.page, retried),
                            ErrorSeverity::Low,
                            "fetch_list",
                            vec![format!("page_{}", fetch.page)],
                            Some("Temporary network or server issues resolved".to_string()),
                        );
                    }
                    if results.is_empty() {
                        sink.add(
                            format!("Page {} returned no results", fetch.page),
                            ErrorSeverity::Low,
                            "fetch_list",
                            vec![format!("page_{}", fetch.page)],
                            Some("May indicate the end of available results".to_string()),
                        );
                    }
                    summaries.extend(results);
                }
                Err(error) => {
                    metrics.pages_failed += 1;
                    let severity = if error.retryable {
                        ErrorSeverity::Medium
                    } else {
                        ErrorSeverity::High
                    };
                    sink.add(
                        format!("Page {} failed: {}", fetch.page, error.message),
                        severity,
                        "fetch_list",
                        vec![format!("page_{}", fetch.page)],
                        Some(format!("Results from page {} unavailable", fetch.page)),
                    );
                }
            }
            metrics.page_timings.push(fetch.timing);
        }

        // Phase 2: detail fetches over the deduplicated union.
        let unique = dedupe_by_external_id(summaries);
        metrics.unique_listings = unique.len();
        metrics.details_requested = unique.len();

        let mut records = Vec::with_capacity(unique.len());
        if !unique.is_empty() {
            let workers = detail_worker_count(
                self.config.max_detail_workers,
                self.pool.available_contexts().await,
                unique.len(),
            );
            debug!(workers, listings = unique.len(), "Starting detail phase");
            let limiter = Arc::new(Semaphore::new(workers));

            let detail_results = join_all(unique.into_iter().map(|summary| {
                let limiter = Arc::clone(&limiter);
                async move {
                    let _permit = limiter.acquire().await.ok();
                    let outcome = self.fetch_detail_with_retry(&summary.external_id).await;
                    (summary, outcome)
                }
            }))
            .await;

            for (summary, outcome) in detail_results {
                match outcome {
                    Ok((detail, retried)) => {
                        metrics.details_succeeded += 1;
                        let mut warnings = Vec::new();
                        if retried > 0 {
                            let message = format!(
                                "Detail for {} succeeded after {} retries",
                                summary.external_id, retried
                            );
                            sink.add(
                                message.clone(),
                                ErrorSeverity::Low,
                                "fetch_detail",
                                vec![summary.external_id.clone()],
                                None,
                            );
                            warnings.push(message);
                        }
                        records.push(ScrapedListing {
                            summary,
                            detail: Some(detail),
                            warnings,
                            distance_km: None,
                        });
                    }
                    Err(error) => {
                        metrics.details_failed += 1;
                        sink.add_error(
                            &error,
                            vec![summary.external_id.clone()],
                            Some(format!(
                                "Listing {} persisted without detail data",
                                summary.external_id
                            )),
                        );
                        records.push(ScrapedListing {
                            summary,
                            detail: None,
                            warnings: vec![error.message.clone()],
                            distance_km: None,
                        });
                    }
                }
            }
        }

        // Operation-level severity from the page success rate.
        let success_rate = if query.page_count > 0 {
            f64::from(metrics.pages_successful) / f64::from(query.page_count) * 100.0
        } else {
            0.0
        };
        if metrics.pages_failed > 0 {
            if success_rate < 50.0 {
                sink.add(
                    format!(
                        "Low success rate: only {}/{} pages succeeded ({success_rate:.1}%)",
                        metrics.pages_successful, query.page_count
                    ),
                    ErrorSeverity::High,
                    "pipeline",
                    vec![format!("pages_1_to_{}", query.page_count)],
                    Some("Significant data loss due to multiple page failures".to_string()),
                );
            } else if success_rate < 80.0 {
                sink.add(
                    format!(
                        "Moderate success rate: {}/{} pages succeeded ({success_rate:.1}%)",
                        metrics.pages_successful, query.page_count
                    ),
                    ErrorSeverity::Medium,
                    "pipeline",
                    vec![format!("pages_1_to_{}", query.page_count)],
                    Some("Some data loss due to page failures".to_string()),
                );
            }
        }

        // Optional radius post-filter.
        let location_filter = match (query.radius_km, query.location.as_deref()) {
            (Some(radius), Some(location)) if radius > 0 => {
                Some(self.apply_radius_filter(&mut records, location, f64::from(radius), &mut sink))
            }
            _ => None,
        };

        let browser_metrics = self.pool.metrics().await;
        metrics.finish(
            started.elapsed().as_millis() as u64,
            browser_metrics.max_concurrent_reached,
        );

        info!(
            pages_ok = metrics.pages_successful,
            pages_failed = metrics.pages_failed,
            listings = records.len(),
            details_failed = metrics.details_failed,
            wall_ms = metrics.wall_time_ms,
            "Scrape pipeline run complete"
        );

        Ok(ScrapeReport {
            success: true,
            partial_success: !sink.is_empty(),
            records,
            warnings: sink.into_vec(),
            performance_metrics: metrics,
            browser_metrics,
            location_filter,
        })
    }

    async fn fetch_page_with_retry(&self, query: &SearchQuery, page: u32) -> PageFetch {
        let url = query.page_url(page);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let outcome = self
                .pool
                .run_bounded(self.source.fetch_list(query, page))
                .await
                .and_then(|inner| inner);

            match outcome {
                Ok(results) => {
                    return PageFetch {
                        page,
                        timing: PageTiming {
                            page_number: page,
                            url,
                            duration_ms: started.elapsed().as_millis() as u64,
                            success: true,
                            retry_count: attempt,
                            results_count: results.len(),
                            error_category: None,
                        },
                        result: Ok(results),
                    };
                }
                Err(e) => {
                    let error = classify_error(&e, "fetch_list");
                    if error.should_retry(attempt, self.config.retry_count) {
                        let delay = backoff_delay(attempt);
                        warn!(
                            page,
                            attempt,
                            category = error.category.as_str(),
                            "Retrying page fetch in {:.1}s",
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return PageFetch {
                        page,
                        timing: PageTiming {
                            page_number: page,
                            url,
                            duration_ms: started.elapsed().as_millis() as u64,
                            success: false,
                            retry_count: attempt,
                            results_count: 0,
                            error_category: Some(error.category.as_str().to_string()),
                        },
                        result: Err(error),
                    };
                }
            }
        }
    }

    async fn fetch_detail_with_retry(
        &self,
        external_id: &str,
    ) -> Result<(ListingDetail, u32), StructuredError> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .pool
                .run_bounded(self.source.fetch_detail(external_id))
                .await
                .and_then(|inner| inner);

            match outcome {
                Ok(detail) => return Ok((detail, attempt)),
                Err(e) => {
                    let error = classify_error(&e, "fetch_detail");
                    if error.should_retry(attempt, self.config.retry_count) {
                        let delay = backoff_delay(attempt);
                        warn!(
                            external_id,
                            attempt,
                            category = error.category.as_str(),
                            "Retrying detail fetch in {:.1}s",
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn apply_radius_filter(
        &self,
        records: &mut Vec<ScrapedListing>,
        location: &str,
        radius_km: f64,
        sink: &mut WarningSink,
    ) -> RadiusFilterStats {
        let Some(origin) = self.gazetteer.resolve_location(location) else {
            sink.add(
                format!("Could not resolve search origin '{location}'; radius filter skipped"),
                ErrorSeverity::Low,
                "location_filter",
                vec![],
                None,
            );
            return RadiusFilterStats {
                origin_coordinates: None,
                radius_km,
                kept_count: records.len(),
                excluded_count: 0,
                missing_count: 0,
                excluded_ids: vec![],
                missing_ids: vec![],
            };
        };

        let mut kept = Vec::with_capacity(records.len());
        let mut excluded_ids = Vec::new();
        let mut missing_ids = Vec::new();

        for mut record in records.drain(..) {
            let coords = record
                .detail
                .as_ref()
                .and_then(|d| d.location.as_ref())
                .and_then(|loc| {
                    loc.zip
                        .as_deref()
                        .and_then(|zip| self.gazetteer.postal_coords(zip))
                        .or_else(|| {
                            loc.city
                                .as_deref()
                                .and_then(|city| self.gazetteer.resolve_location(city))
                        })
                });

            match coords {
                None => {
                    missing_ids.push(record.summary.external_id.clone());
                    // Unresolvable listings stay in the result set.
                    kept.push(record);
                }
                Some(coords) => {
                    let distance = haversine_km(origin, coords);
                    if distance <= radius_km {
                        record.distance_km = Some((distance * 10.0).round() / 10.0);
                        kept.push(record);
                    } else {
                        excluded_ids.push(record.summary.external_id.clone());
                    }
                }
            }
        }

        let stats = RadiusFilterStats {
            origin_coordinates: Some(origin),
            radius_km,
            kept_count: kept.len(),
            excluded_count: excluded_ids.len(),
            missing_count: missing_ids.len(),
            excluded_ids,
            missing_ids,
        };
        *records = kept;
        stats
    }
}

fn dedupe_by_external_id(summaries: Vec<ListingSummary>) -> Vec<ListingSummary> {
    let mut seen = HashSet::new();
    summaries
        .into_iter()
        .filter(|s| seen.insert(s.external_id.clone()))
        .collect()
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.pow(attempt) as f64;
    let jitter: f64 = rand::rng().random_range(0.0..1.0);
    Duration::from_secs_f64(base + jitter)
}
