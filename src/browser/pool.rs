//! Bounded pool of reusable browser contexts.
//!
//! One shared headless browser hosts many isolated CDP browser contexts.
//! Contexts are checked out exclusively, reused from an idle list, and a
//! global semaphore caps the number of scraping operations in flight.
//!
//! Invariant: `in_pool + in_use <= max_contexts`; every acquire is paired
//! with exactly one release on all exit paths.

use anyhow::{Context as _, Result};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::setup::launch_browser;

/// Configuration for the context pool.
#[derive(Debug, Clone)]
pub struct ContextPoolConfig {
    /// Maximum browser contexts alive at once (idle + checked out).
    pub max_contexts: usize,
    /// Global cap on concurrently running scrape operations.
    pub max_concurrent: usize,
    pub headless: bool,
}

impl Default for ContextPoolConfig {
    fn default() -> Self {
        Self {
            max_contexts: 10,
            max_concurrent: 5,
            headless: true,
        }
    }
}

/// An exclusively checked-out browser context.
///
/// Tracks the pages opened through it so the pool can close them on release.
#[derive(Debug)]
pub struct PooledContext {
    id: u64,
    context_id: BrowserContextId,
    pages: Vec<Page>,
}

impl PooledContext {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
}

/// Point-in-time pool counters, embedded in scrape reports.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolMetrics {
    pub contexts_created: u64,
    pub contexts_reused: u64,
    pub in_pool: usize,
    pub in_use: usize,
    pub max_contexts: usize,
    pub current_concurrent: usize,
    pub max_concurrent_reached: usize,
}

/// Bounded pool of reusable browser contexts over one shared browser.
pub struct ContextPool {
    config: ContextPoolConfig,
    session: Mutex<Option<BrowserSession>>,
    idle: Mutex<Vec<PooledContext>>,
    in_use: AtomicUsize,
    next_id: AtomicU64,
    contexts_created: AtomicU64,
    contexts_reused: AtomicU64,
    semaphore: Arc<Semaphore>,
    current_concurrent: AtomicUsize,
    max_concurrent_reached: AtomicUsize,
}

impl ContextPool {
    pub fn new(config: ContextPoolConfig) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Arc::new(Self {
            config,
            session: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            contexts_created: AtomicU64::new(0),
            contexts_reused: AtomicU64::new(0),
            semaphore,
            current_concurrent: AtomicUsize::new(0),
            max_concurrent_reached: AtomicUsize::new(0),
        })
    }

    /// Launch the shared browser. Must be called before the first acquire.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        let (browser, handler, user_data_dir) = launch_browser(self.config.headless).await?;
        *session = Some(BrowserSession {
            browser,
            handler,
            user_data_dir,
        });
        info!(
            max_contexts = self.config.max_contexts,
            max_concurrent = self.config.max_concurrent,
            "Browser context pool started"
        );
        Ok(())
    }

    /// Check out a context, reusing an idle one when available.
    ///
    /// Waits cooperatively when `max_contexts` are already alive.
    pub async fn acquire_context(&self) -> Result<PooledContext> {
        loop {
            {
                let mut idle = self.idle.lock().await;
                if let Some(ctx) = idle.pop() {
                    self.contexts_reused.fetch_add(1, Ordering::Relaxed);
                    self.in_use.fetch_add(1, Ordering::Relaxed);
                    debug!(context = ctx.id, "Reusing browser context from pool");
                    return Ok(ctx);
                }
            }

            let alive = self.in_use.load(Ordering::Relaxed) + self.idle.lock().await.len();
            if alive < self.config.max_contexts {
                let ctx = self.create_context().await?;
                self.in_use.fetch_add(1, Ordering::Relaxed);
                debug!(context = ctx.id, "Created browser context");
                return Ok(ctx);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Return a context to the pool.
    ///
    /// Closes any pages opened on it, then keeps it idle while the idle list
    /// stays under `max_contexts / 2`; beyond that the context is disposed so
    /// steady-state memory stays bounded while bursts are absorbed.
    pub async fn release_context(&self, mut ctx: PooledContext) {
        for page in ctx.pages.drain(..) {
            if let Err(e) = page.close().await {
                warn!(context = ctx.id, "Failed to close page on release: {e}");
            }
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.max_contexts / 2 {
            debug!(context = ctx.id, "Returning browser context to pool");
            idle.push(ctx);
        } else {
            drop(idle);
            debug!(context = ctx.id, "Disposing surplus browser context");
            if let Err(e) = self.dispose_context(&ctx.context_id).await {
                warn!(context = ctx.id, "Failed to dispose browser context: {e}");
            }
        }
    }

    /// Open a fresh blank page inside the given context.
    pub async fn open_page(&self, ctx: &mut PooledContext) -> Result<Page> {
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .context("Browser context pool is not started")?;
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(ctx.context_id.clone())
            .build()
            .map_err(anyhow::Error::msg)?;
        let page = session
            .browser
            .new_page(params)
            .await
            .context("Failed to open page in browser context")?;
        ctx.pages.push(page.clone());
        Ok(page)
    }

    /// Run `op` under the global concurrency semaphore.
    pub async fn run_bounded<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("Concurrency semaphore closed")?;
        let level = self.current_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_reached.fetch_max(level, Ordering::SeqCst);
        let out = op.await;
        self.current_concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(out)
    }

    /// Contexts that could still be checked out right now.
    pub async fn available_contexts(&self) -> usize {
        self.config
            .max_contexts
            .saturating_sub(self.in_use.load(Ordering::Relaxed))
    }

    pub async fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            contexts_reused: self.contexts_reused.load(Ordering::Relaxed),
            in_pool: self.idle.lock().await.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            max_contexts: self.config.max_contexts,
            current_concurrent: self.current_concurrent.load(Ordering::Relaxed),
            max_concurrent_reached: self.max_concurrent_reached.load(Ordering::Relaxed),
        }
    }

    /// Dispose all contexts and close the shared browser.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down browser context pool");

        let idle: Vec<PooledContext> = self.idle.lock().await.drain(..).collect();
        for ctx in &idle {
            if let Err(e) = self.dispose_context(&ctx.context_id).await {
                warn!(context = ctx.id, "Failed to dispose browser context: {e}");
            }
        }

        let mut session = self.session.lock().await;
        if let Some(mut session) = session.take() {
            session.handler.abort();
            if let Err(e) = session.browser.close().await {
                warn!("Failed to close browser: {e}");
            }
            let _ = session.browser.wait().await;
            if let Err(e) = std::fs::remove_dir_all(&session.user_data_dir) {
                warn!(
                    "Failed to remove user data dir {}: {e}",
                    session.user_data_dir.display()
                );
            }
        }

        info!("Browser context pool shutdown complete");
        Ok(())
    }

    async fn create_context(&self) -> Result<PooledContext> {
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .context("Browser context pool is not started")?;
        let resp = session
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .context("Failed to create browser context")?;
        let context_id = resp.result.browser_context_id.clone();
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(PooledContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            context_id,
            pages: Vec::new(),
        })
    }

    async fn dispose_context(&self, context_id: &BrowserContextId) -> Result<()> {
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .context("Browser context pool is not started")?;
        session
            .browser
            .execute(DisposeBrowserContextParams::new(context_id.clone()))
            .await
            .context("Failed to dispose browser context")?;
        Ok(())
    }
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("max_contexts", &self.config.max_contexts)
            .field("max_concurrent", &self.config.max_concurrent)
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
