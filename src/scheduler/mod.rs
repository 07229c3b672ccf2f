//! Persistent job scheduler.
//!
//! Each active job runs its own loop task; all runtime state (job mirrors,
//! loop handles, per-job run guards) lives behind one lock. Every mutation
//! performs the durable write first, then reconciles the runtime map, then
//! starts or cancels loops. A per-job guard makes `run_once` conflict with
//! an in-flight loop iteration instead of overlapping it.

pub mod bootstrap;

pub use bootstrap::{BootstrapJob, parse_job_configs};

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, ListingEvent, ListingImagesUpdated};
use crate::scrape::ScrapePipeline;
use crate::store::{
    Database, JobBookkeeping, JobParams, JobRegistry, ListingStore, ScheduledJob,
    job::{JobParamsUpdate, RunStatus},
};

/// Caller-visible scheduler failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job '{0}' already exists")]
    NameTaken(String),
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("job {0} is currently running")]
    Busy(i64),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<i64, ScheduledJob>,
    loops: HashMap<i64, JoinHandle<()>>,
    run_guards: HashMap<i64, Arc<Mutex<()>>>,
}

pub struct Scheduler {
    db: Database,
    pipeline: Arc<ScrapePipeline>,
    event_bus: Option<Arc<EventBus>>,
    bootstrap_jobs: Vec<BootstrapJob>,
    state: Mutex<SchedulerState>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        pipeline: Arc<ScrapePipeline>,
        event_bus: Option<Arc<EventBus>>,
        bootstrap_jobs: Vec<BootstrapJob>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            db,
            pipeline,
            event_bus,
            bootstrap_jobs,
            state: Mutex::new(SchedulerState::default()),
            shutdown,
        })
    }

    /// Materialise bootstrap jobs, load the registry, launch active loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut tx = self.db.begin().await?;
        for config in &self.bootstrap_jobs {
            if JobRegistry::get_by_name(&mut tx, &config.name).await?.is_some() {
                // Never overwrite a live row from the environment.
                continue;
            }
            info!(
                job = %config.name,
                interval = config.interval_seconds,
                "Bootstrapping scheduler job"
            );
            if let Err(e) = JobRegistry::create(
                &mut tx,
                &config.name,
                config.interval_seconds,
                &config.params,
                config.is_active,
            )
            .await
            {
                warn!(job = %config.name, "Skipping invalid bootstrap job: {e}");
            }
        }
        let jobs = JobRegistry::list(&mut tx).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        let to_start: Vec<i64> = {
            let mut state = self.state.lock().await;
            state.jobs.clear();
            let mut to_start = Vec::new();
            for job in jobs {
                let id = job.id;
                state.run_guards.entry(id).or_default();
                if job.is_active {
                    to_start.push(id);
                }
                state.jobs.insert(id, job);
            }
            to_start
        };

        for job_id in &to_start {
            self.spawn_loop(*job_id).await;
        }
        if to_start.is_empty() {
            info!("Scheduler initialised without active jobs");
        } else {
            info!(active_jobs = to_start.len(), "Scheduler started");
        }
        Ok(())
    }

    /// Snapshot copy of all job runtimes.
    pub async fn list(&self) -> Vec<ScheduledJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ScheduledJob> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Persist and activate a new job.
    pub async fn add(
        self: &Arc<Self>,
        name: &str,
        interval_seconds: i64,
        params: JobParams,
        is_active: bool,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut tx = self.db.begin().await?;
        if JobRegistry::get_by_name(&mut tx, name).await?.is_some() {
            return Err(SchedulerError::NameTaken(name.to_string()));
        }
        let job = JobRegistry::create(&mut tx, name, interval_seconds, &params, is_active).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        let id = job.id;
        {
            let mut state = self.state.lock().await;
            state.run_guards.entry(id).or_default();
            state.jobs.insert(id, job.clone());
        }
        if is_active {
            self.spawn_loop(id).await;
        }
        Ok(job)
    }

    /// Merge a partial update; the loop restarts iff the job is active.
    pub async fn update(
        self: &Arc<Self>,
        id: i64,
        params: Option<JobParamsUpdate>,
        interval_seconds: Option<i64>,
        is_active: Option<bool>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut tx = self.db.begin().await?;
        let existing = JobRegistry::get_by_id(&mut tx, id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;
        let merged = params.map(|update| existing.params.merged_with(&update));
        let job =
            JobRegistry::update_config(&mut tx, id, merged.as_ref(), interval_seconds, is_active)
                .await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        {
            let mut state = self.state.lock().await;
            state.jobs.insert(id, job.clone());
        }
        if job.is_active {
            self.spawn_loop(id).await;
        } else {
            self.cancel_loop(id).await;
        }
        Ok(job)
    }

    /// Enable or disable a job.
    pub async fn set_active(
        self: &Arc<Self>,
        id: i64,
        active: bool,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut tx = self.db.begin().await?;
        if JobRegistry::get_by_id(&mut tx, id).await?.is_none() {
            return Err(SchedulerError::NotFound(id));
        }
        let job = JobRegistry::update_config(&mut tx, id, None, None, Some(active)).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        {
            let mut state = self.state.lock().await;
            state.jobs.insert(id, job.clone());
        }
        if active {
            self.spawn_loop(id).await;
        } else {
            self.cancel_loop(id).await;
        }
        Ok(job)
    }

    /// Remove a job from persistence and cancel its loop.
    pub async fn delete(&self, id: i64) -> Result<ScheduledJob, SchedulerError> {
        let mut tx = self.db.begin().await?;
        if !JobRegistry::delete(&mut tx, id).await? {
            return Err(SchedulerError::NotFound(id));
        }
        tx.commit().await.map_err(anyhow::Error::from)?;

        self.cancel_loop(id).await;
        let removed = {
            let mut state = self.state.lock().await;
            state.run_guards.remove(&id);
            state.jobs.remove(&id)
        };
        removed.ok_or(SchedulerError::NotFound(id))
    }

    /// Execute one run immediately.
    ///
    /// Conflicts when a loop iteration for the job is currently in flight.
    pub async fn run_once(&self, id: i64) -> Result<ScheduledJob, SchedulerError> {
        let (job, guard) = {
            let state = self.state.lock().await;
            let job = state.jobs.get(&id).cloned().ok_or(SchedulerError::NotFound(id))?;
            let guard = state
                .run_guards
                .get(&id)
                .cloned()
                .ok_or(SchedulerError::NotFound(id))?;
            (job, guard)
        };

        let Ok(_running) = guard.try_lock() else {
            return Err(SchedulerError::Busy(id));
        };
        self.execute_job(&job).await;
        drop(_running);

        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Signal shutdown, cancel all loops, await them, reset state.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            state.jobs.clear();
            state.run_guards.clear();
            state.loops.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        let _ = self.shutdown.send(false);
        info!("Scheduler shutdown complete");
    }

    async fn spawn_loop(self: &Arc<Self>, job_id: i64) {
        let scheduler = Arc::clone(self);
        let mut state = self.state.lock().await;
        if let Some(old) = state.loops.remove(&job_id) {
            old.abort();
        }
        let handle = tokio::spawn(async move { scheduler.run_loop(job_id).await });
        state.loops.insert(job_id, handle);
    }

    async fn cancel_loop(&self, job_id: i64) {
        let handle = self.state.lock().await.loops.remove(&job_id);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Per-job loop: snapshot, execute, wait interval or shutdown.
    async fn run_loop(self: Arc<Self>, job_id: i64) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let snapshot = {
                let state = self.state.lock().await;
                state.jobs.get(&job_id).cloned()
            };
            let Some(job) = snapshot else { break };
            if !job.is_active {
                break;
            }

            info!(job = %job.name, interval = job.interval_seconds, "Scheduler job started");
            let guard = {
                let state = self.state.lock().await;
                state.run_guards.get(&job_id).cloned()
            };
            let Some(guard) = guard else { break };
            {
                let _running = guard.lock().await;
                self.execute_job(&job).await;
            }

            let interval = Duration::from_secs(job.interval_seconds.max(1) as u64);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(job_id, "Scheduler job loop stopped");
    }

    /// One run: scrape, persist in a single transaction, publish events,
    /// write bookkeeping, refresh the runtime mirror. Never propagates.
    async fn execute_job(&self, job: &ScheduledJob) {
        let started_at = Utc::now();
        let timer = Instant::now();
        let next_run_at = started_at + ChronoDuration::seconds(job.interval_seconds.max(0));
        let query = job.params.to_search_query();
        let search_params = job.params.search_metadata(&job.name);

        let mut status = RunStatus::Success;
        let mut message: Option<String> = None;
        let mut processed: i64 = 0;
        let mut skipped: i64 = 0;
        let mut analysis_events: Vec<ListingImagesUpdated> = Vec::new();

        let report = match self.pipeline.run(&query).await {
            Ok(report) => Some(report),
            Err(e) => {
                status = RunStatus::Error;
                message = Some(format!("Listing fetch failed: {e:#}"));
                error!(job = %job.name, "Listing fetch failed: {e:#}");
                None
            }
        };

        let persisted = async {
            let mut tx = self.db.begin().await?;

            if let Some(report) = &report {
                for record in &report.records {
                    if record.summary.external_id.trim().is_empty() {
                        warn!(job = %job.name, "Skipping listing without valid id");
                        skipped += 1;
                        continue;
                    }
                    match ListingStore::upsert(
                        &mut tx,
                        &record.summary,
                        record.detail.as_ref(),
                        Some(&job.name),
                        Some(&search_params),
                    )
                    .await
                    {
                        Ok(outcome) => {
                            if outcome.images_changed && self.event_bus.is_some() {
                                analysis_events.push(ListingImagesUpdated {
                                    listing_id: outcome.listing.id,
                                    external_id: outcome.listing.external_id.clone(),
                                    image_urls: outcome.listing.image_urls.clone(),
                                    triggered_at: Utc::now(),
                                });
                            }
                            processed += 1;
                        }
                        Err(e) => {
                            error!(
                                job = %job.name,
                                external_id = %record.summary.external_id,
                                "Failed to persist listing: {e:#}"
                            );
                            skipped += 1;
                        }
                    }
                }
            }

            let bookkeeping = JobBookkeeping {
                last_run_at: started_at,
                next_run_at,
                status,
                message: message.clone(),
                duration_seconds: timer.elapsed().as_secs_f64(),
                result_count: processed,
            };
            JobRegistry::update_bookkeeping(&mut tx, job.id, &bookkeeping).await?;
            tx.commit().await.map_err(anyhow::Error::from)?;
            Ok::<JobBookkeeping, anyhow::Error>(bookkeeping)
        }
        .await;

        let bookkeeping = match persisted {
            Ok(bookkeeping) => Some(bookkeeping),
            Err(e) => {
                error!(job = %job.name, "Failed to persist scheduler run: {e:#}");
                None
            }
        };

        if let (Some(bus), false) = (&self.event_bus, analysis_events.is_empty()) {
            for event in analysis_events.drain(..) {
                if let Err(e) = bus.publish(ListingEvent::ImagesUpdated(event)) {
                    error!(job = %job.name, "Failed to publish image analysis event: {e}");
                }
            }
        }

        if let Some(bookkeeping) = bookkeeping {
            let mut state = self.state.lock().await;
            if let Some(runtime) = state.jobs.get_mut(&job.id) {
                runtime.last_run_at = Some(bookkeeping.last_run_at);
                runtime.next_run_at = Some(bookkeeping.next_run_at);
                runtime.last_run_status = Some(bookkeeping.status.as_str().to_string());
                runtime.last_run_message = bookkeeping.message.clone();
                runtime.last_run_duration_seconds = Some(bookkeeping.duration_seconds);
                runtime.last_result_count = Some(bookkeeping.result_count);
                runtime.updated_at = Utc::now();
            }
        }

        info!(
            job = %job.name,
            processed,
            skipped,
            status = status.as_str(),
            "Completed scheduler job run"
        );
    }
}
