//! Headless Chrome management: launch plumbing and the bounded context pool.

pub mod pool;
pub mod setup;

pub use pool::{ContextPool, ContextPoolConfig, PoolMetrics, PooledContext};
pub use setup::{find_browser_executable, launch_browser};
