pub mod analyzer;
pub mod browser;
pub mod config;
pub mod events;
pub mod scheduler;
pub mod scrape;
pub mod source;
pub mod store;

pub use analyzer::{AnalysisConfig, ImageAnalyzer};
pub use browser::{ContextPool, ContextPoolConfig, PoolMetrics};
pub use config::AppConfig;
pub use events::{EventBus, ListingAnalysisCompleted, ListingEvent, ListingImagesUpdated};
pub use scheduler::{Scheduler, SchedulerError};
pub use scrape::{PipelineConfig, ScrapePipeline, ScrapeReport};
pub use source::{ListingDetail, ListingSource, ListingSummary, SearchQuery};
pub use store::Database;
