//! Scheduler behaviour: bootstrap + first run, run-once conflicts, config
//! updates taking effect immediately, liveness under source failures, and
//! the mutation API's typed errors.

mod common;

use adscout::browser::{ContextPool, ContextPoolConfig};
use adscout::events::{EventBus, EventKind, ListingEvent};
use adscout::scheduler::{Scheduler, SchedulerError, parse_job_configs};
use adscout::scrape::{PipelineConfig, ScrapePipeline};
use adscout::source::{ListingDetail, ListingSource, ListingSummary, SearchQuery};
use adscout::store::{Database, JobParams, ListingFilter, ListingStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::MockSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

fn make_pipeline(source: Arc<dyn ListingSource>) -> Arc<ScrapePipeline> {
    Arc::new(ScrapePipeline::new(
        source,
        ContextPool::new(ContextPoolConfig::default()),
        PipelineConfig::default(),
    ))
}

/// Poll until `check` passes or the timeout elapses.
async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn bootstrap_job_runs_and_persists_listings() {
    let db = Database::connect_in_memory().await.unwrap();
    let bus = EventBus::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.subscribe_fn(EventKind::ImagesUpdated, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            if let ListingEvent::ImagesUpdated(payload) = event {
                sink.lock().await.push(payload);
            }
        }
    });
    bus.start().await;

    let source = Arc::new(MockSource::new(2));
    let jobs = parse_job_configs(
        r#"[{"name":"woom","query":"Woom 3","interval_seconds":60}]"#,
        3600,
    );
    let scheduler = Scheduler::new(
        db.clone(),
        make_pipeline(Arc::clone(&source) as Arc<dyn ListingSource>),
        Some(Arc::clone(&bus)),
        jobs,
    );
    scheduler.start().await.unwrap();

    wait_for("first job run", || {
        let scheduler = Arc::clone(&scheduler);
        async move {
            scheduler
                .list()
                .await
                .first()
                .and_then(|job| job.last_run_status.clone())
                .is_some()
        }
    })
    .await;

    let snapshot = scheduler.list().await;
    assert_eq!(snapshot.len(), 1);
    let job = &snapshot[0];
    assert_eq!(job.name, "woom");
    assert_eq!(job.last_run_status.as_deref(), Some("success"));
    assert_eq!(job.last_result_count, Some(2));
    assert_eq!(
        job.next_run_at.unwrap() - job.last_run_at.unwrap(),
        ChronoDuration::seconds(60)
    );

    let mut conn = db.pool().acquire().await.unwrap();
    let (rows, total) = ListingStore::list(
        &mut conn,
        &ListingFilter {
            limit: 10,
            offset: 0,
            query_name: Some("woom".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(total, 2);
    assert!(rows.iter().all(|l| l.query_name.as_deref() == Some("woom")));

    wait_for("image events", || {
        let events = Arc::clone(&events);
        async move { events.lock().await.len() == 2 }
    })
    .await;

    scheduler.shutdown().await;
    bus.stop().await;
}

/// Source that signals when a fetch begins and blocks until released.
struct GatedSource {
    entered: tokio::sync::mpsc::UnboundedSender<()>,
    release: Arc<Notify>,
}

#[async_trait]
impl ListingSource for GatedSource {
    async fn fetch_list(&self, _query: &SearchQuery, _page: u32) -> Result<Vec<ListingSummary>> {
        let _ = self.entered.send(());
        self.release.notified().await;
        Ok(vec![common::summary("9000")])
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<ListingDetail> {
        Ok(common::detail(external_id, &[]))
    }
}

#[tokio::test]
async fn run_once_conflicts_with_an_in_flight_iteration() {
    let db = Database::connect_in_memory().await.unwrap();
    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let source = Arc::new(GatedSource {
        entered: entered_tx,
        release: Arc::clone(&release),
    });

    let jobs = parse_job_configs(r#"[{"name":"gated","interval_seconds":60}]"#, 3600);
    let scheduler = Scheduler::new(db, make_pipeline(source), None, jobs);
    scheduler.start().await.unwrap();

    // The loop's first iteration is now inside fetch_list.
    tokio::time::timeout(Duration::from_secs(5), entered_rx.recv())
        .await
        .expect("loop should start executing")
        .expect("sender alive");

    let job_id = scheduler.list().await[0].id;
    match scheduler.run_once(job_id).await {
        Err(SchedulerError::Busy(id)) => assert_eq!(id, job_id),
        other => panic!("expected Busy, got {other:?}"),
    }

    // The blocked iteration still completes normally with bookkeeping.
    release.notify_one();
    wait_for("gated run to finish", || {
        let scheduler = Arc::clone(&scheduler);
        async move {
            scheduler.list().await[0].last_run_status.as_deref() == Some("success")
        }
    })
    .await;
    assert_eq!(scheduler.list().await[0].last_result_count, Some(1));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn update_restarts_the_loop_with_the_new_interval() {
    let db = Database::connect_in_memory().await.unwrap();
    let source = Arc::new(MockSource::new(1));
    let jobs = parse_job_configs(r#"[{"name":"slow","interval_seconds":3600}]"#, 3600);
    let scheduler = Scheduler::new(
        db,
        make_pipeline(Arc::clone(&source) as Arc<dyn ListingSource>),
        None,
        jobs,
    );
    scheduler.start().await.unwrap();

    wait_for("first run", || {
        let source = Arc::clone(&source);
        async move { source.total_list_calls() >= 1 }
    })
    .await;

    let job_id = scheduler.list().await[0].id;
    let updated = scheduler
        .update(job_id, None, Some(60), Some(true))
        .await
        .unwrap();
    // The runtime mirror reflects the new interval immediately.
    assert_eq!(updated.interval_seconds, 60);
    assert_eq!(scheduler.list().await[0].interval_seconds, 60);

    // The restarted loop executes right away instead of finishing the old
    // hour-long sleep.
    wait_for("run after update", || {
        let source = Arc::clone(&source);
        async move { source.total_list_calls() >= 2 }
    })
    .await;

    scheduler.shutdown().await;
}

#[tokio::test]
async fn loop_survives_source_failures_and_schedules_the_next_run() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut source = MockSource::new(1);
    source.failing_pages = [1].into();
    source.failure_message = "selector .ad-listitem missing field".to_string();
    let source = Arc::new(source);

    let jobs = parse_job_configs(r#"[{"name":"flaky","interval_seconds":60}]"#, 3600);
    let scheduler = Scheduler::new(
        db,
        make_pipeline(Arc::clone(&source) as Arc<dyn ListingSource>),
        None,
        jobs,
    );
    scheduler.start().await.unwrap();

    wait_for("failing run to complete", || {
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.list().await[0].last_run_at.is_some() }
    })
    .await;

    let job = scheduler.list().await[0].clone();
    assert_eq!(job.last_result_count, Some(0));
    assert_eq!(
        job.next_run_at.unwrap() - job.last_run_at.unwrap(),
        ChronoDuration::seconds(60)
    );

    // The loop is alive and idle: an on-demand run goes through.
    let rerun = scheduler.run_once(job.id).await.unwrap();
    assert!(rerun.last_run_at.unwrap() >= job.last_run_at.unwrap());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn mutation_api_reports_typed_errors() {
    let db = Database::connect_in_memory().await.unwrap();
    let source = Arc::new(MockSource::new(0));
    let scheduler = Scheduler::new(
        db,
        make_pipeline(source as Arc<dyn ListingSource>),
        None,
        vec![],
    );
    scheduler.start().await.unwrap();

    let params = JobParams {
        query: Some("woom".to_string()),
        page_count: 1,
        ..Default::default()
    };
    let job = scheduler.add("woom", 120, params.clone(), false).await.unwrap();
    assert!(!job.is_active);

    match scheduler.add("woom", 120, params, false).await {
        Err(SchedulerError::NameTaken(name)) => assert_eq!(name, "woom"),
        other => panic!("expected NameTaken, got {other:?}"),
    }

    match scheduler.update(9999, None, Some(60), None).await {
        Err(SchedulerError::NotFound(id)) => assert_eq!(id, 9999),
        other => panic!("expected NotFound, got {other:?}"),
    }

    let activated = scheduler.set_active(job.id, true).await.unwrap();
    assert!(activated.is_active);

    let deleted = scheduler.delete(job.id).await.unwrap();
    assert_eq!(deleted.id, job.id);
    match scheduler.delete(job.id).await {
        Err(SchedulerError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    scheduler.shutdown().await;
}
