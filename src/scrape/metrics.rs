//! Performance accounting for pipeline runs.

use serde::Serialize;

/// Timing record for one fetched page or detail batch entry.
#[derive(Debug, Clone, Serialize)]
pub struct PageTiming {
    pub page_number: u32,
    pub url: String,
    pub duration_ms: u64,
    pub success: bool,
    pub retry_count: u32,
    pub results_count: usize,
    pub error_category: Option<String>,
}

/// Aggregate metrics over a whole pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub pages_requested: u32,
    pub pages_successful: u32,
    pub pages_failed: u32,
    /// Percentage of pages that succeeded, rounded to two decimals.
    pub success_rate: f64,
    pub details_requested: usize,
    pub details_succeeded: usize,
    pub details_failed: usize,
    pub unique_listings: usize,
    pub wall_time_ms: u64,
    /// Highest concurrency level actually reached in the browser pool.
    pub concurrency_reached: usize,
    pub page_timings: Vec<PageTiming>,
}

impl PipelineMetrics {
    pub fn finish(&mut self, wall_time_ms: u64, concurrency_reached: usize) {
        self.wall_time_ms = wall_time_ms;
        self.concurrency_reached = concurrency_reached;
        self.success_rate = if self.pages_requested == 0 {
            0.0
        } else {
            let rate = f64::from(self.pages_successful) / f64::from(self.pages_requested) * 100.0;
            (rate * 100.0).round() / 100.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_rounded_percentage() {
        let mut metrics = PipelineMetrics {
            pages_requested: 3,
            pages_successful: 2,
            pages_failed: 1,
            ..Default::default()
        };
        metrics.finish(1200, 3);
        assert_eq!(metrics.success_rate, 66.67);
        assert_eq!(metrics.wall_time_ms, 1200);
    }
}
