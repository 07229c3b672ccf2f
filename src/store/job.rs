//! Durable scheduler job configuration and run bookkeeping.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::source::SearchQuery;

/// Smallest interval a job may run at.
pub const MIN_INTERVAL_SECONDS: i64 = 60;
/// Bookkeeping messages are truncated to this many characters.
pub const MAX_RUN_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Search parameters of a job, mirrored into typed columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobParams {
    pub query: Option<String>,
    pub location: Option<String>,
    pub radius: Option<i64>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub page_count: i64,
}

impl JobParams {
    pub fn to_search_query(&self) -> SearchQuery {
        SearchQuery {
            query: self.query.clone(),
            location: self.location.clone(),
            radius_km: self.radius.and_then(|r| u32::try_from(r).ok()),
            min_price: self.min_price,
            max_price: self.max_price,
            page_count: u32::try_from(self.page_count.max(1)).unwrap_or(1),
        }
    }

    /// The per-job param map persisted on listings; includes the job name.
    pub fn search_metadata(&self, name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "query": self.query,
            "location": self.location,
            "radius": self.radius,
            "min_price": self.min_price,
            "max_price": self.max_price,
            "page_count": self.page_count,
        })
    }

    /// Merge a partial update on top of these params.
    pub fn merged_with(&self, update: &JobParamsUpdate) -> JobParams {
        JobParams {
            query: update.query.clone().unwrap_or_else(|| self.query.clone()),
            location: update
                .location
                .clone()
                .unwrap_or_else(|| self.location.clone()),
            radius: update.radius.unwrap_or(self.radius),
            min_price: update.min_price.unwrap_or(self.min_price),
            max_price: update.max_price.unwrap_or(self.max_price),
            page_count: update.page_count.unwrap_or(self.page_count).max(1),
        }
    }
}

/// Partial param update; `None` leaves the field untouched, `Some(None)`
/// clears it.
#[derive(Debug, Clone, Default)]
pub struct JobParamsUpdate {
    pub query: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub radius: Option<Option<i64>>,
    pub min_price: Option<Option<i64>>,
    pub max_price: Option<Option<i64>>,
    pub page_count: Option<i64>,
}

/// One durable scheduler job row.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub params: JobParams,
    pub interval_seconds: i64,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub last_run_message: Option<String>,
    pub last_run_duration_seconds: Option<f64>,
    pub last_result_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one run, written by the scheduler only.
#[derive(Debug, Clone)]
pub struct JobBookkeeping {
    pub last_run_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub status: RunStatus,
    pub message: Option<String>,
    pub duration_seconds: f64,
    pub result_count: i64,
}

pub struct JobRegistry;

impl JobRegistry {
    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs ORDER BY created_at ASC")
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list scheduler jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to query scheduler job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn get_by_name(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to query scheduler job by name")?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn create(
        conn: &mut SqliteConnection,
        name: &str,
        interval_seconds: i64,
        params: &JobParams,
        is_active: bool,
    ) -> Result<ScheduledJob> {
        if interval_seconds < MIN_INTERVAL_SECONDS {
            bail!("interval_seconds must be >= {MIN_INTERVAL_SECONDS}");
        }
        if params.page_count < 1 {
            bail!("page_count must be >= 1");
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                name, query, location, radius, min_price, max_price, page_count,
                interval_seconds, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(&params.query)
        .bind(&params.location)
        .bind(params.radius)
        .bind(params.min_price)
        .bind(params.max_price)
        .bind(params.page_count)
        .bind(interval_seconds)
        .bind(is_active)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("Failed to create scheduler job")?;

        debug!(job = name, id = result.last_insert_rowid(), "Created scheduler job");
        Self::get_by_id(conn, result.last_insert_rowid())
            .await?
            .context("Scheduler job vanished after insert")
    }

    /// Atomically merge a config update into the row.
    pub async fn update_config(
        conn: &mut SqliteConnection,
        id: i64,
        params: Option<&JobParams>,
        interval_seconds: Option<i64>,
        is_active: Option<bool>,
    ) -> Result<ScheduledJob> {
        let existing = Self::get_by_id(conn, id)
            .await?
            .context("Scheduler job not found")?;

        let params = params.cloned().unwrap_or(existing.params);
        let interval = interval_seconds.unwrap_or(existing.interval_seconds);
        if interval < MIN_INTERVAL_SECONDS {
            bail!("interval_seconds must be >= {MIN_INTERVAL_SECONDS}");
        }
        let active = is_active.unwrap_or(existing.is_active);

        sqlx::query(
            r#"
            UPDATE scheduled_jobs SET
                query = ?, location = ?, radius = ?, min_price = ?, max_price = ?,
                page_count = ?, interval_seconds = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&params.query)
        .bind(&params.location)
        .bind(params.radius)
        .bind(params.min_price)
        .bind(params.max_price)
        .bind(params.page_count.max(1))
        .bind(interval)
        .bind(active)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("Failed to update scheduler job")?;

        Self::get_by_id(conn, id)
            .await?
            .context("Scheduler job vanished after update")
    }

    /// Write a run outcome. The only writer of the last-run snapshot.
    pub async fn update_bookkeeping(
        conn: &mut SqliteConnection,
        id: i64,
        bookkeeping: &JobBookkeeping,
    ) -> Result<()> {
        let message = bookkeeping
            .message
            .as_deref()
            .map(|m| m.chars().take(MAX_RUN_MESSAGE_CHARS).collect::<String>());
        sqlx::query(
            r#"
            UPDATE scheduled_jobs SET
                last_run_at = ?, next_run_at = ?, last_run_status = ?,
                last_run_message = ?, last_run_duration_seconds = ?,
                last_result_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(bookkeeping.last_run_at)
        .bind(bookkeeping.next_run_at)
        .bind(bookkeeping.status.as_str())
        .bind(message)
        .bind(bookkeeping.duration_seconds)
        .bind(bookkeeping.result_count)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("Failed to write job bookkeeping")?;
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("Failed to delete scheduler job")?;
        Ok(result.rows_affected() > 0)
    }
}

fn job_from_row(row: &SqliteRow) -> Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        params: JobParams {
            query: row.try_get("query")?,
            location: row.try_get("location")?,
            radius: row.try_get("radius")?,
            min_price: row.try_get("min_price")?,
            max_price: row.try_get("max_price")?,
            page_count: row.try_get("page_count")?,
        },
        interval_seconds: row.try_get("interval_seconds")?,
        is_active: row.try_get("is_active")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_status: row.try_get("last_run_status")?,
        last_run_message: row.try_get("last_run_message")?,
        last_run_duration_seconds: row.try_get("last_run_duration_seconds")?,
        last_result_count: row.try_get("last_result_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
